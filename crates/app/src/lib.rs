use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tilestitch_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use tilestitch_core::error::PipelineError;
use tilestitch_core::grid::{plan, GridPlan};
use tilestitch_core::loader::{discover_inputs, shuffle_files, FsImageSource};
use tilestitch_core::logging::{open_log_file, select_filters, LogTarget, DEFAULT_LOG_FILTER};
use tilestitch_core::onnx::OnnxTransform;
use tilestitch_core::pipeline::{Pipeline, PipelineSettings};
use tilestitch_core::postproc::ThresholdPostProcessor;
use tilestitch_core::runtime::{log_runtime_lib_status, setup_runtime_libs};
use tilestitch_core::sink::{FsResultSink, SinkSettings};
use tilestitch_core::tma;
use tilestitch_core::types::FileRef;

/// Exit code for a run that finished but lost at least one image.
pub const PARTIAL_RUN_EXIT_CODE: i32 = 2;

/// Exit code for a run aborted by a fatal engine error.
pub const ABORTED_RUN_EXIT_CODE: i32 = 3;

/// Map an error that ended the process to its exit code.
pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<PipelineError>() {
        Some(failure) if failure.is_fatal() => ABORTED_RUN_EXIT_CODE,
        _ => 1,
    }
}

#[derive(Parser)]
#[command(
    name = "tilestitch",
    about = "Tile large images, run a patch model, and stitch the predictions back together"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every image in a directory.
    Run(RunArgs),
    /// Print the patch grid for an image size as JSON.
    Plan(PlanArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    #[arg(short = 'i', long, help = "Directory of input tiles (not searched recursively)")]
    input_dir: PathBuf,
    #[arg(short = 'o', long)]
    output_dir: PathBuf,
    #[arg(long, help = "Output sub-directory name; defaults to the input directory name")]
    slide_name: Option<String>,
    #[arg(long, value_name = "CSV", help = "TMA scanner summary giving each spot's slide position")]
    summary: Option<PathBuf>,
    #[arg(long, help = "ONNX model; overrides inference.model_path")]
    model: Option<PathBuf>,
    #[arg(long)]
    window_size: Option<usize>,
    #[arg(long)]
    stride: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long, help = "Post-processing workers (0 = inline)")]
    post_proc_workers: Option<usize>,
    #[arg(long, help = "Patch extraction threads (0 = inline)")]
    extraction_workers: Option<usize>,
    #[arg(long)]
    save_qupath: bool,
    #[arg(long)]
    save_raw_map: bool,
    #[arg(long)]
    max_files: Option<usize>,
    #[arg(long, help = "Shuffle the input order with this seed")]
    shuffle_seed: Option<u64>,
}

#[derive(Args, Debug)]
struct PlanArgs {
    height: usize,
    width: usize,
    #[arg(long)]
    window_size: Option<usize>,
    #[arg(long)]
    stride: Option<usize>,
}

/// Parse the command line, run it, and return the process exit code.
pub async fn run_from_env() -> Result<i32> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let ort_status = setup_runtime_libs();
    init_logging(&cli, &resolved_data_dir);
    log_runtime_lib_status(&ort_status);
    log_startup_metadata(&resolved_data_dir);

    let config = load_config(&resolved_data_dir)?;
    match cli.command {
        Commands::Run(args) => run_images(args, config, resolved_data_dir).await,
        Commands::Plan(args) => {
            println!("{}", plan_json(&args, &config)?);
            Ok(0)
        }
    }
}

/// The log file of a `run` sits in its output directory; everything else
/// logs under the data directory.
fn log_target(cli: &Cli, data_dir: &Path) -> LogTarget {
    match &cli.command {
        Commands::Run(args) => LogTarget::RunOutput(args.output_dir.clone()),
        Commands::Plan(_) => LogTarget::DataDir(data_dir.to_path_buf()),
    }
}

fn init_logging(cli: &Cli, data_dir: &Path) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filters = select_filters(cli.verbose, cli.log_filter.as_deref(), rust_log.as_deref());
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    let target = log_target(cli, data_dir);
    let (installed, file_error) = match open_log_file(&target) {
        Ok(log_file) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(log_file.appender)
                .with_filter(parse_env_filter_with_fallback(&filters.file, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            (tracing::subscriber::set_global_default(subscriber), None)
        }
        Err(error) => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            (tracing::subscriber::set_global_default(subscriber), Some(error))
        }
    };

    if let Err(error) = installed {
        eprintln!("Failed to initialize tracing subscriber: {error}. Continuing without structured tracing.");
        return;
    }
    match file_error {
        None => info!(
            filter = %filters.console,
            filter_origin = %filters.origin,
            log_dir = %target.log_dir().display(),
            "Logging initialized"
        ),
        Some(error) => warn!(
            filter = %filters.console,
            filter_origin = %filters.origin,
            log_dir = %error.dir().display(),
            reason = %error,
            "Log file unavailable; continuing with console-only logging"
        ),
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    let cfg_path = config_path(data_dir);
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> Result<AppConfig> {
    if let Err(error) = initialize_data_dir(data_dir) {
        warn!(error = %error, "Failed to initialize data directory");
    }
    AppConfig::load_from_path(&config_path(data_dir))
}

/// Fold command-line overrides into the loaded configuration.
fn apply_overrides(config: &mut AppConfig, args: &RunArgs) {
    if let Some(window_size) = args.window_size {
        config.tiling.window_size = window_size;
    }
    if let Some(stride) = args.stride {
        config.tiling.stride = stride;
    }
    if let Some(batch_size) = args.batch_size {
        config.inference.batch_size = batch_size;
    }
    if let Some(workers) = args.extraction_workers {
        config.inference.extraction_workers = workers;
    }
    if let Some(workers) = args.post_proc_workers {
        config.post_process.workers = workers;
    }
    if let Some(model) = &args.model {
        config.inference.model_path = Some(model.clone());
    }
    config.output.save_qupath |= args.save_qupath;
    config.output.save_raw_map |= args.save_raw_map;
}

fn slide_name(args: &RunArgs) -> String {
    args.slide_name.clone().unwrap_or_else(|| {
        args.input_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "slide".to_string())
    })
}

/// List, place, order, and cap the input files.
fn prepare_files(args: &RunArgs) -> Result<Vec<FileRef>> {
    let mut files = discover_inputs(&args.input_dir)?;
    if files.is_empty() {
        bail!("no image files found in {}", args.input_dir.display());
    }

    if let Some(summary) = &args.summary {
        let spots = tma::load_summary(summary)?;
        let matched = tma::attach_placements(&mut files, &spots);
        info!(
            spots = spots.len(),
            files = files.len(),
            matched,
            "Attached TMA spot placements"
        );
    }
    if let Some(seed) = args.shuffle_seed {
        shuffle_files(&mut files, Some(seed));
    }
    if let Some(max_files) = args.max_files {
        files.truncate(max_files);
    }
    Ok(files)
}

fn plan_json(args: &PlanArgs, config: &AppConfig) -> Result<String> {
    let grid: GridPlan = plan(
        args.height,
        args.width,
        args.window_size.unwrap_or(config.tiling.window_size),
        args.stride.unwrap_or(config.tiling.stride),
    )?;
    serde_json::to_string_pretty(&grid).context("failed to serialize grid plan")
}

async fn run_images(args: RunArgs, mut config: AppConfig, data_dir: PathBuf) -> Result<i32> {
    apply_overrides(&mut config, &args);
    config.validate()?;

    let files = prepare_files(&args)?;
    let model_path = config
        .inference
        .model_path
        .as_deref()
        .map(|path| resolve_relative_to(&data_dir, path))
        .context("no model configured; pass --model or set inference.model_path")?;
    if !model_path.is_file() {
        bail!("model file does not exist: {}", model_path.display());
    }

    let transform = OnnxTransform::load(&config.inference, &model_path, &data_dir)?;
    let processor = ThresholdPostProcessor::new(config.post_process.clone(), config.cell_types.clone());
    let sink = FsResultSink::create(SinkSettings {
        output_dir: args.output_dir.clone(),
        slide_name: slide_name(&args),
        save_qupath: config.output.save_qupath,
        save_raw_map: config.output.save_raw_map,
        merge_rotation: config.output.merge_rotation,
        cell_types: config.cell_types.clone(),
    })?;

    let mut pipeline = Pipeline::new(
        FsImageSource,
        transform,
        Arc::new(processor),
        sink,
        PipelineSettings::from_config(&config),
    );
    let report = pipeline.run(files).await?;
    let report_path = pipeline.sink().report_path();

    info!(
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        report = %report_path.display(),
        "Run complete"
    );
    if report.is_partial() {
        for failure in &report.failed {
            warn!(
                image = %failure.name,
                id = ?failure.image_id,
                stage = ?failure.stage,
                reason = %failure.reason,
                "Image failed"
            );
        }
        return Ok(PARTIAL_RUN_EXIT_CODE);
    }
    Ok(0)
}
