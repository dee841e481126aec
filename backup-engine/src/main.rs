//! Backup Engine - command line entry point
//!
//! Every command prints its result as JSON on stdout. Exit status is 0 on
//! success, 1 on partial success and 2 on failure.

use anyhow::{Context, Result};
use backup_engine::archiver::BackupMode;
use backup_engine::daemon::shutdown::ShutdownCoordinator;
use backup_engine::manifest::{Category, Component};
use backup_engine::{utils, Engine, EngineConfig, EngineError, RunOutcome};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take a backup
    Backup {
        #[arg(value_parser = parse_category)]
        category: Category,

        /// Force a full backup
        #[arg(long, conflicts_with = "incremental")]
        full: bool,

        /// Force an incremental backup (full when there is no usable baseline)
        #[arg(long)]
        incremental: bool,
    },
    /// Restore a backup onto the live system
    Restore {
        manifest_id: String,

        /// Components to restore; all when omitted
        #[arg(long, value_delimiter = ',', value_parser = parse_component)]
        components: Vec<Component>,
    },
    /// List local backups, newest first
    List {
        #[arg(long, value_parser = parse_category)]
        category: Option<Category>,
    },
    /// Re-check a stored backup and its chain
    Verify { manifest_id: String },
    /// Show backup health
    Status,
    /// Apply retention now
    Prune,
    /// Write the default configuration
    InitConfig {
        /// Output file; stdout when omitted
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

fn parse_category(s: &str) -> std::result::Result<Category, String> {
    s.parse().map_err(|e: EngineError| e.to_string())
}

fn parse_component(s: &str) -> std::result::Result<Component, String> {
    s.parse().map_err(|e: EngineError| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            let kind = e
                .downcast_ref::<EngineError>()
                .map(|e| e.kind())
                .unwrap_or("error");
            tracing::error!(kind, "{:#}", e);
            eprintln!("{}: {:#}", kind, e);
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    if let Command::InitConfig { output } = &args.command {
        let toml = EngineConfig::default().to_toml()?;
        match output {
            Some(path) => {
                std::fs::write(path, toml).with_context(|| format!("writing {}", path.display()))?;
                println!("Configuration written to {}", path.display());
            }
            None => print!("{}", toml),
        }
        return Ok(ExitCode::SUCCESS);
    }

    // Load configuration
    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => {
            let config = EngineConfig::default();
            config.validate()?;
            config
        }
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("backup-engine v{}", env!("CARGO_PKG_VERSION"));
    let engine = Engine::from_config(config)?;

    match args.command {
        Command::Backup {
            category,
            full,
            incremental,
        } => {
            let mode = if full {
                BackupMode::Full
            } else if incremental {
                BackupMode::Incremental
            } else {
                BackupMode::Auto
            };

            let shutdown = ShutdownCoordinator::new();
            let cancel = shutdown.token();
            let signals = tokio::spawn(async move { shutdown.wait_for_signal().await });

            let result = engine.run_backup_with(category, mode, &cancel).await;
            signals.abort();
            let result = result?;
            print_json(&result)?;
            Ok(match result.outcome {
                RunOutcome::Succeeded => ExitCode::SUCCESS,
                RunOutcome::PartiallySucceeded => ExitCode::from(1),
                RunOutcome::Failed => ExitCode::from(2),
            })
        }
        Command::Restore {
            manifest_id,
            components,
        } => {
            let result = engine.run_restore(&manifest_id, &components).await?;
            print_json(&result)?;
            Ok(if result.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
        Command::List { category } => {
            print_json(&engine.list_manifests(category)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Verify { manifest_id } => {
            let report = engine.verify(&manifest_id).await?;
            print_json(&report)?;
            Ok(if report.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
        Command::Status => {
            print_json(&engine.status()?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Prune => {
            let report = engine.prune().await?;
            print_json(&report)?;
            Ok(if report.failures.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Command::InitConfig { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
