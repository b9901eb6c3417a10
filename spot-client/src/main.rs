//! spot-client: command-line host for the SpotMe reservation core.
//!
//! ## Subcommands
//!
//! - `status`: fetch lot congestion and spot states once
//! - `claim`: query, navigate to and soft-reserve one spot
//! - `watch`: stay connected and print every refresh until interrupted
//! - `send`: raw request for any operation

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use spot_client::notify::ConsoleSink;
use spot_client::{config, launcher, logging, Session};
use spot_core::{CacheSnapshot, CongestionLevel, Phase, SpotId};

#[derive(Parser)]
#[command(name = "spot-client")]
#[command(about = "SpotMe parking client")]
#[command(version)]
struct Cli {
    /// Server URL (ws://host:port), overrides config and SPOTME_ENDPOINT
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Config file instead of ~/.config/spotme/config.toml
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every lot with its congestion and free spots
    Status,

    /// Reserve a spot and start navigation to it
    Claim {
        #[arg(value_name = "SPOT")]
        spot_id: SpotId,

        /// Keep the reservation until Ctrl+C, then release it
        #[arg(long)]
        hold: bool,
    },

    /// Print lot status after every refresh until interrupted
    Watch,

    /// Send one request and print the answer
    Send {
        #[arg(value_name = "OP")]
        op: String,

        /// Request fields as a JSON object
        #[arg(value_name = "JSON", default_value = "{}")]
        body: String,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "spot-client failed");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut cfg = match &cli.config {
        Some(path) => config::load_with(path)?,
        None => config::load(),
    };
    if let Some(endpoint) = cli.endpoint {
        cfg.endpoint = endpoint;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let launcher = launcher::from_command(cfg.nav_command.as_deref());
        let session = Session::with_parts(cfg, Arc::new(ConsoleSink), launcher);
        session
            .connect()
            .await
            .with_context(|| format!("cannot reach {}", session.config().endpoint))?;

        match cli.command {
            Commands::Status => {
                session.refresh().await?;
                let snapshot = session.snapshot().await;
                print_lots(&snapshot);
            }
            Commands::Claim { spot_id, hold } => claim(&session, spot_id, hold).await?,
            Commands::Watch => watch(&session).await?,
            Commands::Send { op, body } => {
                let body: Value = serde_json::from_str(&body).context("request body is not JSON")?;
                let response = session.request(op, body).await?;
                println!("{}", serde_json::to_string_pretty(&response)?);
            }
        }
        session.disconnect().await;
        Ok(())
    })
}

async fn claim(session: &Session, spot_id: SpotId, hold: bool) -> anyhow::Result<()> {
    session.refresh().await?;
    let attempt = session.claim(spot_id).await?;
    if attempt.phase() != Phase::Accepted || !hold {
        return Ok(());
    }
    println!("Holding spot {spot_id}; press Ctrl+C to release it.");
    shutdown_signal().await?;
    session.release(spot_id).await?;
    Ok(())
}

async fn watch(session: &Session) -> anyhow::Result<()> {
    let mut versions = session.subscribe_refreshes();
    let _refresher = session.spawn_refresh_loop();
    session.refresh().await?;
    loop {
        let snapshot = session.snapshot().await;
        print_lots(&snapshot);
        tokio::select! {
            changed = versions.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            r = shutdown_signal() => {
                r?;
                break;
            }
        }
    }
    Ok(())
}

fn print_lots(snapshot: &CacheSnapshot) {
    println!("-- refresh {} --", snapshot.version());
    for lot in snapshot.lots() {
        let free = snapshot
            .spots_in_lot(&lot.lot_id)
            .iter()
            .filter(|s| s.status == spot_core::SpotStatus::Available)
            .count();
        let congestion = match (lot.congestion.level(), lot.congestion.fraction()) {
            (CongestionLevel::Unknown, _) | (_, None) => "unknown".to_string(),
            (level, Some(f)) => format!("{:.0}% ({level:?})", f * 100.0),
        };
        println!(
            "{:<8} {:<24} {:>4}/{:<4} free  congestion {}",
            lot.lot_id, lot.name, free, lot.spot_count, congestion
        );
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
