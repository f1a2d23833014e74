//! warehouse-migrate CLI - job descriptor tooling for the migration pipeline.
//!
//! Concrete warehouse drivers are wired up by the embedding service through
//! the library API; this binary operates on job descriptors only: it
//! validates them and prints the deterministic task plan the coordinator
//! would execute.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};
use warehouse_migrate::staging::partition_path;
use warehouse_migrate::{idempotency_key, MigrationJob, PipelineError, TaskKind};

#[derive(Parser)]
#[command(name = "warehouse-migrate")]
#[command(about = "Warehouse table migration pipeline tooling")]
#[command(version)]
struct Cli {
    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a job descriptor file
    Validate {
        /// Path to the YAML job descriptor
        #[arg(short, long)]
        job: PathBuf,
    },

    /// Print the per-table task plan for a job descriptor
    Plan {
        /// Path to the YAML job descriptor
        #[arg(short, long)]
        job: PathBuf,

        /// Output the plan as JSON
        #[arg(long)]
        output_json: bool,
    },
}

/// The three idempotency-keyed stages planned for one table.
#[derive(Debug, Serialize)]
struct TablePlan {
    source: String,
    target: String,
    window: String,
    staging_path: String,
    extract_key: String,
    load_key: String,
    validate_key: String,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), PipelineError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    match cli.command {
        Commands::Validate { job } => {
            let descriptor = MigrationJob::load(&job)?;
            descriptor.validate()?;
            info!("Loaded job descriptor from {:?}", job);
            println!(
                "Job descriptor OK: {} tables, window {}",
                descriptor.tables.len(),
                descriptor.window
            );
        }

        Commands::Plan { job, output_json } => {
            let descriptor = MigrationJob::load(&job)?;
            descriptor.validate()?;

            let plans: Vec<TablePlan> = descriptor
                .tables
                .iter()
                .map(|t| TablePlan {
                    source: t.source.clone(),
                    target: t.target.clone(),
                    window: descriptor.window.to_string(),
                    staging_path: partition_path(&t.source, &descriptor.window),
                    extract_key: idempotency_key(&t.source, &descriptor.window, TaskKind::Extract),
                    load_key: idempotency_key(&t.source, &descriptor.window, TaskKind::Load),
                    validate_key: idempotency_key(
                        &t.source,
                        &descriptor.window,
                        TaskKind::Validate,
                    ),
                })
                .collect();

            if output_json {
                println!("{}", serde_json::to_string_pretty(&plans)?);
            } else {
                for plan in &plans {
                    println!("{} -> {}", plan.source, plan.target);
                    println!("  window:   {}", plan.window);
                    println!("  staging:  {}", plan.staging_path);
                    println!("  extract:  {}", plan.extract_key);
                    println!("  load:     {}", plan.load_key);
                    println!("  validate: {}", plan.validate_key);
                }
            }
        }
    }

    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
