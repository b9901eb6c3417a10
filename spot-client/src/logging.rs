//! tracing setup for the binaries. `SPOTME_DEBUG_LOG=1` forces debug output;
//! otherwise `RUST_LOG` applies, defaulting to info.

use std::env;

use tracing_subscriber::EnvFilter;

pub fn init() {
    let debug_enabled = env::var("SPOTME_DEBUG_LOG")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
