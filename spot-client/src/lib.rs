//! SpotMe client host: drives `spot_core` over a WebSocket channel with tokio.

pub(crate) mod claim;
pub mod channel;
pub mod config;
pub mod correlator;
pub mod launcher;
pub mod logging;
pub mod notify;
pub mod session;

#[cfg(test)]
mod testing;

pub use session::{Session, SessionError};
