use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nir_sync::{maybe_build_scheduler, NodeGateway, SyncConfig};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "nir-cli")]
#[command(about = "Node Incident Reconciler command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one node.
    Process { node: String },
    /// Reconcile every node found in the source tables.
    ProcessAll,
    /// Open/closed counts of one node.
    Status { node: String },
    /// List known nodes.
    Nodes {
        #[arg(long)]
        comparison: bool,
    },
    /// Delete expired cache entries.
    PurgeCache,
    /// Run the HTTP API, plus the cron scheduler when enabled.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing output")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    init_tracing(config.log_json);
    let gateway = Arc::new(NodeGateway::connect(&config).await?);

    match cli.command.unwrap_or(Commands::ProcessAll) {
        Commands::Process { node } => {
            let outcome = gateway.process_node(&node).await?;
            print_json(&outcome)?;
            if !outcome.success {
                bail!(
                    "processing node {} failed: {}",
                    outcome.node,
                    outcome.error.unwrap_or_default()
                );
            }
        }
        Commands::ProcessAll => {
            let summary = gateway.process_all().await?;
            print_json(&summary)?;
            if summary.is_partial() {
                bail!("{} of {} nodes failed", summary.errors, summary.total_nodes);
            }
        }
        Commands::Status { node } => {
            print_json(&gateway.get_node_status(&node).await?)?;
        }
        Commands::Nodes { comparison } => {
            if comparison {
                print_json(&gateway.compare_nodes().await?)?;
            } else {
                print_json(&gateway.list_nodes().await?)?;
            }
        }
        Commands::PurgeCache => {
            let purged = gateway.purge_expired_cache().await;
            println!("purged {purged} expired cache entries");
        }
        Commands::Serve { port } => {
            let scheduler = maybe_build_scheduler(gateway.clone(), &config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.process_cron, "scheduler started");
            }
            tokio::select! {
                served = nir_web::serve(gateway, port.unwrap_or(config.web_port)) => served?,
                _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
            }
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
    }

    Ok(())
}
