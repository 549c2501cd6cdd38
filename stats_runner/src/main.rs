// THEORY:
// `stats_runner` is the command-line front end for the `frame_stats` library.
// It prints the per-channel mean and standard deviation of every frame under a
// dataset root, normalized to [0, 1], and offers helper commands to inspect a
// dataset and to write or check a configuration file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use frame_stats::{
    BarProgress, FailurePolicy, NullProgress, PipelineConfig, ProgressSink, Report, StatsPipeline,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// How long to wait for blocking decodes after a run before exiting anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "stats_runner")]
#[command(about = "Compute per-channel mean and std of a frame dataset", long_about = None)]
struct Cli {
    /// Path to a YAML or JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Dataset root holding one directory per video
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Fixed upper bound on concurrently processed videos
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Exclude videos that fail to decode instead of aborting
    #[arg(long, global = true)]
    best_effort: bool,

    /// Hide the progress bar
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the statistics (default if no command specified)
    Run,

    /// Count videos and frames without decoding anything
    Analyze,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "stats.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // --- 1. Logging ---
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // --- 2. Argument Parsing ---
    let cli = Cli::parse();

    match &cli.command {
        None | Some(Commands::Run) => run_command(&cli),
        Some(Commands::Analyze) => analyze_command(&cli),
        Some(Commands::Validate) => validate_command(&cli),
        Some(Commands::GenerateConfig { output }) => generate_config_command(output),
    }
}

/// Reads the configuration file (if any) and applies command-line overrides.
fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    if let Some(root) = &cli.root {
        config.data_root = root.clone();
    }
    if let Some(workers) = cli.workers {
        config.max_workers = workers;
    }
    if cli.best_effort {
        config.failure_policy = FailurePolicy::BestEffort;
    }

    config.validate()?;
    Ok(config)
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    Ok(runtime)
}

fn run_command(cli: &Cli) -> Result<()> {
    // --- 3. Pipeline Initialization ---
    let config = load_config(cli)?;
    let pipeline = StatsPipeline::new(config)?;
    tracing::info!(
        "Processing {} with up to {} videos in flight",
        pipeline.config().data_root.display(),
        pipeline.worker_cap()
    );

    let progress: Box<dyn ProgressSink> = if cli.quiet {
        Box::new(NullProgress)
    } else {
        Box::new(BarProgress::new())
    };

    // --- 4. Run, stopping cleanly on Ctrl-C ---
    let runtime = build_runtime()?;
    let abort = pipeline.abort_handle();
    let result = runtime.block_on(async {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted; stopping after in-flight frames");
                abort.abort();
            }
        });
        pipeline.run(progress).await
    });
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    // --- 5. Report ---
    let report = result.context("statistics run failed")?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &Report) {
    println!("Mean: {}", format_vector(&report.statistics.mean));
    println!("Standard Deviation: {}", format_vector(&report.statistics.std_dev));
    println!("{}", report);

    for failure in &report.failed_units {
        println!("Excluded {}: {}", failure.unit, failure.reason);
    }
}

fn format_vector(values: &[f64]) -> String {
    let parts: Vec<String> = values.iter().map(|v| format!("{:.8}", v)).collect();
    format!("[{}]", parts.join(", "))
}

fn analyze_command(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let pipeline = StatsPipeline::new(config)?;
    let units = pipeline.discover()?;

    let mut frames = 0usize;
    let mut empty = 0usize;
    for unit in &units {
        let count = unit
            .frame_paths()
            .with_context(|| format!("listing frames of {}", unit.path.display()))?
            .len();
        if count == 0 {
            empty += 1;
        }
        frames += count;
    }

    println!("\n=== Work Analysis ===");
    println!("Dataset root: {}", pipeline.config().data_root.display());
    println!("Videos: {}", units.len());
    println!("Empty videos: {}", empty);
    println!("Frames: {}", frames);
    if !units.is_empty() {
        println!("Average frames per video: {:.1}", frames as f64 / units.len() as f64);
    }
    println!("Concurrent videos: {}", pipeline.worker_cap());
    println!("=====================\n");

    Ok(())
}

fn validate_command(cli: &Cli) -> Result<()> {
    load_config(cli)?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: &Path) -> Result<()> {
    let yaml = r#"# Frame dataset statistics configuration

# Directory with one subdirectory of frames per video
data_root: "./20bn-jester-v1"

# Fixed upper bound on videos processed at once.
# The effective bound is min(max_workers, number of CPUs).
max_workers: 32

# Channels per pixel: 1 (gray), 3 (RGB) or 4 (RGBA).
# Frames with a different channel count fail to decode.
channels: 3

# fail_fast: abort on the first video that fails to decode
# best_effort: skip failing videos and report how many were skipped
failure_policy: fail_fast

# Bits per source sample (8 or 16); samples are divided by 2^bit_depth - 1
bit_depth: 8

# population (divide by N) or sample (divide by N - 1)
variance: population

# Give up on a single video after this many seconds (omit for no limit)
# unit_timeout_secs: 600
"#;

    std::fs::write(output, yaml)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
