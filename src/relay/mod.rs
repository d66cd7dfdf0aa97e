//! WebSocket relay to the ReturnFeed aggregation server.

pub mod client;
pub mod message;

use thiserror::Error;

pub use client::{
    relay_queue, spawn, RelayClient, RelayConfig, RelayEvent, RelayHandle, RelayService, RelayStats, RelayStatsSnapshot,
};
pub use message::{MessageKind, RelayMessage, TallyUpdate};

/// Relay errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to connect to relay: {0}")]
    Connect(String),

    #[error("Failed to send message: {0}")]
    Send(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),
}
