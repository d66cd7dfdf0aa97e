//! vMix tally bridge.
//!
//! A TCP subscription tells us *that* tally changed; a debounced HTTP fetch
//! tells us *what* it is now. Snapshots are diffed and only real changes
//! reach subscribers and the relay.
//!
//! ```text
//! TallyNotifier --NotifierEvent--> TallyBridge --BridgeEvent--> caller
//!                                    |  ^
//!                        StateFetcher+  +--> RelayHandle
//! ```

pub mod bridge;
pub mod fetcher;
pub mod notifier;
pub mod publisher;
pub mod state;
pub mod xml;

use thiserror::Error;

use crate::http::HttpError;

pub use bridge::{spawn, BridgeConfig, BridgeEvent, ConnectionStatus, TallyBridge, TallyHandle};
pub use fetcher::{StateFetcher, VmixHttpFetcher};
pub use notifier::{NotifierConfig, NotifierEvent, TallyNotifier};
pub use publisher::{Publication, TallyPublisher};
pub use state::{InputDescriptor, TallyState, TallyTag};

/// Tally bridge errors
#[derive(Error, Debug)]
pub enum TallyError {
    #[error("vMix connection failed: {0}")]
    Connect(String),

    #[error("vMix API request failed: {0}")]
    Http(#[from] HttpError),

    #[error("Invalid vMix XML: {0}")]
    Parse(String),
}
