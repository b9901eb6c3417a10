//! gateway-sim: pretends to be a sensor gateway and reports random spot changes.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use spot_client::launcher::LogLauncher;
use spot_client::notify::LogSink;
use spot_client::{config, logging, Session};
use spot_core::protocol::update_spot_body;
use spot_core::{OpTag, SpotId, SpotStatus};

#[derive(Parser)]
#[command(name = "gateway-sim")]
#[command(about = "Send random UpdateSpot messages to a SpotMe server")]
#[command(version)]
struct Args {
    /// Server URL, e.g. ws://host:15024 (default from config)
    #[arg(long)]
    endpoint: Option<String>,

    /// Delay between updates
    #[arg(long, default_value_t = 3000)]
    interval_ms: u64,

    /// Lowest spot id to touch
    #[arg(long, default_value_t = 1)]
    first_spot: SpotId,

    /// Highest spot id to touch
    #[arg(long, default_value_t = 10)]
    last_spot: SpotId,

    /// Stop after this many updates (0 = run until interrupted)
    #[arg(long, default_value_t = 0)]
    count: u64,
}

/// Gateways report every state a sensor can see, reserved included.
const STATUSES: [SpotStatus; 3] = [SpotStatus::Available, SpotStatus::Occupied, SpotStatus::Reserved];

fn random_update(rng: &mut impl Rng, first: SpotId, last: SpotId) -> (SpotId, SpotStatus) {
    let spot_id = rng.gen_range(first..=last);
    (spot_id, STATUSES[rng.gen_range(0..STATUSES.len())])
}

fn main() {
    logging::init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        tracing::error!(error = %e, "gateway-sim failed");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    anyhow::ensure!(args.first_spot <= args.last_spot, "empty spot range");
    let mut cfg = config::load();
    if let Some(endpoint) = args.endpoint {
        cfg.endpoint = endpoint;
    }
    cfg.refresh_interval_secs = 0;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let session = Session::with_parts(cfg, Arc::new(LogSink), Arc::new(LogLauncher));
        session.connect().await?;
        let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
        let mut sent = 0u64;
        while args.count == 0 || sent < args.count {
            ticker.tick().await;
            let (spot_id, status) = random_update(&mut rand::thread_rng(), args.first_spot, args.last_spot);
            match session.request(OpTag::UpdateSpot, update_spot_body(spot_id, status)).await {
                Ok(response) => tracing::info!(
                    spot_id,
                    status = status.as_str(),
                    answer = response.status.as_deref().unwrap_or("-"),
                    "update sent"
                ),
                Err(e) => {
                    tracing::warn!(spot_id, error = %e, "update failed");
                    session.connect().await?;
                }
            }
            sent += 1;
        }
        session.disconnect().await;
        Ok(())
    })
}
