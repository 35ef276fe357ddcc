//! saas-metrics CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use saas_metrics_pipeline::{run_pipeline, LogFacadeSink, PipelineConfig};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "saas-metrics")]
#[command(about = "Builds the SaaS metrics table from billing and accounting data")]
#[command(version)]
struct Cli {
    /// Log verbosity (off, error, warn, info, debug, trace). Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<LevelFilter>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, normalize, merge and publish the metrics table
    Run {
        /// Pipeline configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Check a configuration file without running anything
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the JSON Schema of the configuration file
    Schema,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = cli.log_level {
        logger.filter_level(level);
    }
    logger.init();

    match cli.command {
        Commands::Run { config } => cmd_run(&config),
        Commands::Validate { config } => cmd_validate(&config),
        Commands::Schema => cmd_schema(),
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::from_file(path)
        .with_context(|| format!("loading configuration {}", path.display()))
}

fn cmd_run(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let output = run_pipeline(&config, Box::new(LogFacadeSink)).context("pipeline run failed")?;

    info!("{}", output.summary);
    println!("{}", output.artifacts.csv.display());
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!(
        "{} is valid (store: {}, raw: {}, output: {})",
        path.display(),
        config.store_path.display(),
        config.raw_dir.display(),
        config.output.dir.display()
    );
    Ok(())
}

fn cmd_schema() -> Result<()> {
    let schema = PipelineConfig::schema_as_json().context("rendering configuration schema")?;
    println!("{}", schema);
    Ok(())
}
