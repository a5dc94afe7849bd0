//! Locating the ONNX Runtime shared library before the first session is built.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Where `libonnxruntime` was found, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrtLibStatus {
    /// `ORT_DYLIB_PATH` was already set by the user.
    FromEnv(PathBuf),
    /// Found next to the executable or in a system directory.
    Discovered(PathBuf),
    NotFound,
}

/// Directories searched for the runtime library, in priority order:
/// `<exe_dir>/lib`, `<exe_dir>/../lib`, `<cwd>/lib`, then system lib dirs on Unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Point `ORT_DYLIB_PATH` at a discovered runtime unless the user already set it.
///
/// Call at the very start of `main()`, before any ORT use. Logging may not be
/// initialized yet, so the outcome is returned for [`log_runtime_lib_status`].
pub fn setup_runtime_libs() -> OrtLibStatus {
    if let Some(path) = env::var_os(ORT_DYLIB_ENV) {
        return OrtLibStatus::FromEnv(PathBuf::from(path));
    }
    match find_ort_dylib_in_dirs(&candidate_lib_dirs()) {
        Some(path) => {
            env::set_var(ORT_DYLIB_ENV, &path);
            OrtLibStatus::Discovered(path)
        }
        None => OrtLibStatus::NotFound,
    }
}

/// Log the runtime library resolution. Call after tracing is initialized.
pub fn log_runtime_lib_status(status: &OrtLibStatus) {
    match status {
        OrtLibStatus::FromEnv(path) if Path::new(path).is_file() => {
            info!(path = %path.display(), "ORT library from ORT_DYLIB_PATH")
        }
        OrtLibStatus::FromEnv(path) => {
            warn!(path = %path.display(), "ORT_DYLIB_PATH is set but the file does not exist")
        }
        OrtLibStatus::Discovered(path) => info!(path = %path.display(), "ORT library discovered"),
        OrtLibStatus::NotFound => {
            warn!("ORT library not found; ORT will try default search paths")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn candidate_lib_dirs_contains_system_paths() {
        let dirs = candidate_lib_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn candidate_lib_dirs_includes_cwd_lib() {
        let dirs = candidate_lib_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
    }

    #[test]
    fn find_ort_dylib_prefers_first_directory() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        let empty = temp.path().join("empty");
        for dir in [&first, &second, &empty] {
            std::fs::create_dir_all(dir).expect("dir should be created");
        }
        std::fs::write(first.join(ORT_LIB_NAME), b"first").expect("lib should be written");
        std::fs::write(second.join(ORT_LIB_NAME), b"second").expect("lib should be written");

        let found = find_ort_dylib_in_dirs(&[empty.clone(), first.clone(), second.clone()]);
        assert_eq!(found, Some(first.join(ORT_LIB_NAME)));
        assert_eq!(find_ort_dylib_in_dirs(&[empty]), None);
    }
}
