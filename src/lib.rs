//! returnfeed-bridge - headless ReturnFeed production engine
//!
//! Features:
//! - vMix tally bridge (TCP change notifications + debounced HTTP/XML fetch)
//! - WebSocket relay of tally and stream status to the ReturnFeed server
//! - SRT publishing through a supervised FFmpeg process to MediaMTX
//! - Adaptive SRT latency from measured round-trip time
//! - NDI preview receiver (vendor runtime or built-in simulator)
//! - JSON settings store and crash log panic hook

pub mod config;
pub mod crash;
pub mod http;
pub mod ndi;
pub mod relay;
pub mod stream;
pub mod tally;

pub use config::{ConfigError, Settings, SettingsStore};
pub use http::{HttpClient, HttpError};
pub use ndi::{NdiError, NdiReceiver, ReceiverConfig, ReceiverEvent, SimulatorContext, SourceProvider};
pub use relay::{
    relay_queue, RelayClient, RelayConfig, RelayError, RelayEvent, RelayHandle, RelayMessage, RelayService,
};
pub use stream::{
    MediaMtxClient, MediaMtxEndpoint, NetworkMonitor, StreamError, StreamEvent, StreamParams, StreamSupervisor,
};
pub use tally::{BridgeEvent, TallyBridge, TallyError, TallyHandle, TallyState, TallyTag};
