//! WolfCluster - Database Cluster Coordinator
//!
//! Runs a cluster of MariaDB databases described by a TOML file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use wolfcluster::backend::{BackendRef, MariaDbBackend};
use wolfcluster::cluster::{ClusterOptions, DatabaseCluster};
use wolfcluster::config::WolfClusterConfig;

/// WolfCluster - Database Cluster Coordinator
#[derive(Parser)]
#[command(name = "wolfcluster")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfcluster.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the configured level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator and keep the cluster in sync until Ctrl-C
    Start {
        /// Seconds between status summaries in the log
        #[arg(long, default_value_t = 30)]
        summary_interval: u64,
    },

    /// Connect every database, synchronize them and print member status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfcluster.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The config may not exist yet (init), so fall back to defaults
    let logging = WolfClusterConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or(logging.level);
    init_logging(&level, &logging.format);

    match cli.command {
        Commands::Start { summary_interval } => {
            run_start(cli.config, Duration::from_secs(summary_interval.max(1))).await
        }
        Commands::Status { json } => run_status(cli.config, json).await,
        Commands::Init { output, force } => run_init(output, force),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let fmt_layer = match format {
        "compact" => tracing_subscriber::fmt::layer().compact().boxed(),
        "pretty" => tracing_subscriber::fmt::layer().pretty().boxed(),
        _ => tracing_subscriber::fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn load_config(path: &PathBuf) -> anyhow::Result<WolfClusterConfig> {
    WolfClusterConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// Start the coordinator
async fn run_start(config_path: PathBuf, summary_interval: Duration) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    tracing::info!(
        "Starting cluster {} with {} databases",
        config.cluster.name,
        config.databases.len()
    );

    let cluster = DatabaseCluster::from_config(&config)
        .await
        .context("No configured database could seed the cluster")?;

    let mut ticker = tokio::time::interval(summary_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let summary = cluster.summary().await;
                tracing::info!(
                    "Cluster {}: {}/{} ready, {} processing, {} unsynchronised, {} ejected, {} paused, {} dead",
                    cluster.name(),
                    summary.ready,
                    summary.total_members,
                    summary.processing,
                    summary.unsynchronised,
                    summary.ejected,
                    summary.paused,
                    summary.dead
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }

    cluster.shutdown().await;
    tracing::info!("WolfCluster shutdown complete");
    Ok(())
}

/// Connect, synchronize and report every configured database
async fn run_status(config_path: PathBuf, json: bool) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    let mut options = ClusterOptions::from(&config.cluster);
    options.protected_tables = Some(config.protected_tables());
    let cluster = DatabaseCluster::new(config.tables.clone(), options);

    let mut unreachable = Vec::new();
    for db in &config.databases {
        let backend: BackendRef = match MariaDbBackend::connect(db).await {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                unreachable.push((db.identity(), e.to_string()));
                continue;
            }
        };
        if let Err(e) = cluster.add_database_and_wait(backend).await {
            tracing::warn!("{}", e);
        }
    }

    let summary = cluster.summary().await;
    let members = cluster.members().await;

    if json {
        let unreachable: Vec<serde_json::Value> = unreachable
            .iter()
            .map(|(id, reason)| serde_json::json!({ "id": id, "reason": reason }))
            .collect();
        let report = serde_json::json!({
            "cluster": cluster.name(),
            "summary": summary,
            "members": members,
            "unreachable": unreachable,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Cluster {}", cluster.name());
        println!("==========================");
        println!();
        println!("{:<48} {:<16} {:>8}", "MEMBER", "STATUS", "QUEUED");
        for member in &members {
            println!(
                "{:<48} {:<16} {:>8}",
                member.id.to_string(),
                member.status.to_string(),
                member.queued_writes
            );
        }
        for (id, reason) in &unreachable {
            println!("{:<48} {:<16} {}", id.to_string(), "UNREACHABLE", reason);
        }
        println!();
        println!(
            "Ready: {}/{} ({} unreachable)",
            summary.ready,
            config.databases.len(),
            unreachable.len()
        );
    }

    cluster.shutdown().await;
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite",
            output.display()
        );
    }

    std::fs::write(&output, WolfClusterConfig::example())
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to list your databases and required tables.");
    println!("Then start with: wolfcluster start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match WolfClusterConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Cluster: {}", config.cluster.name);
            for db in &config.databases {
                println!("  Database: {}", db.identity());
            }
            let tables: Vec<&str> = config.tables.iter().map(|t| t.name.as_str()).collect();
            println!("  Required tables: {}", tables.join(", "));
            println!("  Protected tables: {}", config.protected_tables().join(", "));
            println!("  Max parallel writes: {}", config.cluster.max_parallel_writes);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
