//! NDI preview receiver.
//!
//! ```text
//! SourceProvider --open--> FrameSource --capture--> NdiReceiver thread --ReceiverEvent--> consumer
//!  (SDK | simulator)                                  to_rgb, fps, bitrate
//! ```
//!
//! Without the `ndi` feature (or without the runtime installed) the
//! simulator stands in.

pub mod bitrate;
pub mod convert;
pub mod frame;
pub mod receiver;
#[cfg(feature = "ndi")]
pub mod sdk;
pub mod simulator;
pub mod source;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;

pub use frame::{AudioFrame, RgbImage, VideoFormat, VideoFrame};
pub use receiver::{FrameInfo, NdiReceiver, ReceiverConfig, ReceiverEvent, ReceiverStatsSnapshot};
pub use simulator::SimulatorContext;
pub use source::{BandwidthMode, Captured, FrameSource, SourceProvider};

/// NDI errors
#[derive(Error, Debug)]
pub enum NdiError {
    #[error("Failed to initialize NDI: {0}")]
    Init(String),

    #[error("NDI source not found: {0}")]
    SourceNotFound(String),

    #[error("Failed to create receiver: {0}")]
    Receiver(String),

    #[error("NDI capture failed: {0}")]
    Sdk(String),

    #[error("Unsupported video format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid video frame: {0}")]
    InvalidFrame(String),
}

static NDI_INIT: Once = Once::new();
static NDI_AVAILABLE: AtomicBool = AtomicBool::new(false);

/// Check if the NDI runtime can be loaded.
pub fn is_available() -> bool {
    NDI_INIT.call_once(|| {
        let available = probe_runtime();
        NDI_AVAILABLE.store(available, Ordering::SeqCst);
        if available {
            info!("[NDI] Runtime available");
        } else {
            warn!("[NDI] Runtime not available - using simulator");
        }
    });
    NDI_AVAILABLE.load(Ordering::SeqCst)
}

#[cfg(feature = "ndi")]
fn probe_runtime() -> bool {
    grafton_ndi::NDI::new().is_ok()
}

#[cfg(not(feature = "ndi"))]
fn probe_runtime() -> bool {
    false
}

/// The SDK provider when the runtime loads, otherwise `simulator`.
pub fn default_provider(simulator: SimulatorContext) -> Box<dyn SourceProvider> {
    #[cfg(feature = "ndi")]
    {
        if is_available() {
            match sdk::NdiSdkProvider::new() {
                Ok(provider) => return Box::new(provider),
                Err(e) => warn!("[NDI] {}", e),
            }
        }
    }

    #[cfg(not(feature = "ndi"))]
    let _ = is_available();

    Box::new(simulator)
}

impl SourceProvider for Box<dyn SourceProvider> {
    fn discover(&self, timeout: Duration) -> Result<Vec<String>, NdiError> {
        (**self).discover(timeout)
    }

    fn open(&self, name: &str, bandwidth: BandwidthMode) -> Result<Box<dyn FrameSource + '_>, NdiError> {
        (**self).open(name, bandwidth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "ndi"))]
    #[test]
    fn test_falls_back_to_simulator() {
        assert!(!is_available());
        let provider = default_provider(SimulatorContext::new());
        assert_eq!(provider.discover(Duration::ZERO).unwrap().len(), 3);
    }

    #[test]
    fn test_boxed_provider_drives_receiver() {
        let provider: Box<dyn SourceProvider> = Box::new(SimulatorContext::new().with_format(16, 16, 100));
        let (mut receiver, rx) =
            NdiReceiver::start(provider, "Test Camera 2 (Simulated)", ReceiverConfig::default()).unwrap();
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, ReceiverEvent::Frame(_)));
        receiver.stop();
    }
}
