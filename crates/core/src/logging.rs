//! Tracing filters and the persistent log file.
//!
//! A `run` writes its log next to the run's `report.json`, so one output
//! directory holds everything needed to audit that run. Other commands log
//! into daily files under the data directory.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const LOG_DIR_NAME: &str = "logs";
pub const LOG_FILE_PREFIX: &str = "tilestitch";

/// Daily files kept under the data directory.
pub const DATA_DIR_RETENTION_FILES: usize = 14;

/// ONNX Runtime is chatty at info level.
const NOISE_FILTER: &str = "ort=error";

/// Per-batch and per-image detail always kept in the log file.
const FILE_DETAIL_FILTER: &str = "tilestitch_core=debug";

/// Which input decided the user filter, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOrigin {
    Flag,
    Verbosity,
    Environment,
    Default,
}

impl FilterOrigin {
    /// Only a filter the user typed on the command line is taken verbatim.
    fn is_explicit(self) -> bool {
        matches!(self, Self::Flag | Self::Verbosity)
    }
}

impl std::fmt::Display for FilterOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flag => write!(f, "--log-filter"),
            Self::Verbosity => write!(f, "-v"),
            Self::Environment => write!(f, "RUST_LOG"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub origin: FilterOrigin,
    pub console: String,
    pub file: String,
}

/// `--log-filter` wins, then `-v` (debug) / `-vv` (trace), then `RUST_LOG`.
///
/// Without a command-line choice the ORT noise filter is prepended and the
/// file additionally records engine debug detail.
pub fn select_filters(verbose: u8, flag: Option<&str>, env: Option<&str>) -> LogFilters {
    let (origin, user) = match (flag, verbose, env) {
        (Some(filter), _, _) => (FilterOrigin::Flag, filter),
        (None, 2..=u8::MAX, _) => (FilterOrigin::Verbosity, "trace"),
        (None, 1, _) => (FilterOrigin::Verbosity, "debug"),
        (None, 0, Some(filter)) => (FilterOrigin::Environment, filter),
        (None, 0, None) => (FilterOrigin::Default, DEFAULT_LOG_FILTER),
    };

    if origin.is_explicit() {
        return LogFilters {
            origin,
            console: user.to_string(),
            file: user.to_string(),
        };
    }
    let console = format!("{NOISE_FILTER},{user}");
    LogFilters {
        origin,
        file: format!("{console},{FILE_DETAIL_FILTER}"),
        console,
    }
}

/// Where the persistent log goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Daily files under `<data_dir>/logs`.
    DataDir(PathBuf),
    /// A single `<output_dir>/logs/tilestitch.log`, appended across runs.
    RunOutput(PathBuf),
}

impl LogTarget {
    pub fn log_dir(&self) -> PathBuf {
        match self {
            Self::DataDir(root) | Self::RunOutput(root) => root.join(LOG_DIR_NAME),
        }
    }
}

#[derive(Debug, Error)]
pub enum LogFileError {
    #[error("failed to create log directory {}: {source}", dir.display())]
    CreateDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open log file in {}: {source}", dir.display())]
    Appender {
        dir: PathBuf,
        #[source]
        source: InitError,
    },
}

impl LogFileError {
    pub fn dir(&self) -> &Path {
        match self {
            Self::CreateDir { dir, .. } | Self::Appender { dir, .. } => dir,
        }
    }
}

#[derive(Debug)]
pub struct LogFile {
    pub dir: PathBuf,
    pub appender: RollingFileAppender,
}

pub fn open_log_file(target: &LogTarget) -> Result<LogFile, LogFileError> {
    let dir = target.log_dir();
    if let Err(source) = std::fs::create_dir_all(&dir) {
        return Err(LogFileError::CreateDir { dir, source });
    }

    let builder = RollingFileAppender::builder()
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log");
    let builder = match target {
        LogTarget::DataDir(_) => builder
            .rotation(Rotation::DAILY)
            .max_log_files(DATA_DIR_RETENTION_FILES),
        LogTarget::RunOutput(_) => builder.rotation(Rotation::NEVER),
    };
    match builder.build(&dir) {
        Ok(appender) => Ok(LogFile { dir, appender }),
        Err(source) => Err(LogFileError::Appender { dir, source }),
    }
}
