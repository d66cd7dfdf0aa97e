//! NDI runtime backend (feature `ndi`).

use std::time::Duration;

use grafton_ndi::{
    Error as SdkError, Finder, FinderOptions, LineStrideOrSize, PixelFormat, Receiver, ReceiverBandwidth,
    ReceiverColorFormat, ReceiverOptions, Source, NDI,
};
use log::{debug, info};

use super::frame::{VideoFormat, VideoFrame};
use super::source::{BandwidthMode, Captured, FrameSource, SourceProvider};
use super::NdiError;

/// Discovery and receivers backed by the NDI runtime
pub struct NdiSdkProvider {
    ndi: NDI,
}

impl NdiSdkProvider {
    /// Load the NDI runtime.
    pub fn new() -> Result<Self, NdiError> {
        let ndi = NDI::new().map_err(|e| NdiError::Init(e.to_string()))?;
        info!("[NDI] Runtime initialized");
        Ok(Self { ndi })
    }

    fn find(&self, timeout: Duration) -> Result<Vec<Source>, NdiError> {
        let options = FinderOptions::builder().show_local_sources(true).build();
        let finder = Finder::new(&self.ndi, &options).map_err(|e| NdiError::Init(e.to_string()))?;
        finder
            .wait_for_sources(timeout)
            .map_err(|e| NdiError::Sdk(e.to_string()))?;
        finder
            .sources(Duration::ZERO)
            .map_err(|e| NdiError::Sdk(e.to_string()))
    }
}

impl SourceProvider for NdiSdkProvider {
    fn discover(&self, timeout: Duration) -> Result<Vec<String>, NdiError> {
        let names: Vec<String> = self.find(timeout)?.into_iter().map(|s| s.name.clone()).collect();
        debug!("[NDI] Discovered {} sources", names.len());
        Ok(names)
    }

    fn open(&self, name: &str, bandwidth: BandwidthMode) -> Result<Box<dyn FrameSource + '_>, NdiError> {
        let source = self
            .find(Duration::from_secs(2))?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| NdiError::SourceNotFound(name.to_string()))?;

        let options = ReceiverOptions::builder(source)
            .color(ReceiverColorFormat::RGBX_RGBA)
            .bandwidth(match bandwidth {
                BandwidthMode::Highest => ReceiverBandwidth::Highest,
                BandwidthMode::Lowest => ReceiverBandwidth::Lowest,
            })
            .build();
        let receiver = Receiver::new(&self.ndi, &options).map_err(|e| NdiError::Receiver(e.to_string()))?;
        info!("[NDI] Receiving {} ({} bandwidth)", name, bandwidth);

        Ok(Box::new(SdkSource {
            name: name.to_string(),
            capture: Box::new(move |timeout| match receiver.capture_video(timeout) {
                Ok(video) => {
                    let format = match video.pixel_format {
                        PixelFormat::BGRA => VideoFormat::BGRA,
                        PixelFormat::BGRX => VideoFormat::BGRX,
                        PixelFormat::RGBA => VideoFormat::RGBA,
                        PixelFormat::RGBX => VideoFormat::RGBX,
                        PixelFormat::UYVY => VideoFormat::UYVY,
                        other => return Err(NdiError::UnsupportedFormat(format!("{:?}", other))),
                    };
                    let stride = match video.line_stride_or_size {
                        LineStrideOrSize::LineStrideBytes(stride) => stride.max(0) as u32,
                        LineStrideOrSize::DataSizeBytes(_) => 0,
                    };

                    // owned copy; the SDK buffer is released when `video` drops
                    Ok(Captured::Video(VideoFrame {
                        width: video.width.max(0) as u32,
                        height: video.height.max(0) as u32,
                        format,
                        stride,
                        data: video.data.to_vec(),
                        frame_rate_n: video.frame_rate_n.max(0) as u32,
                        frame_rate_d: video.frame_rate_d.max(0) as u32,
                    }))
                }
                Err(SdkError::Timeout { .. }) => Ok(Captured::None),
                Err(e) => Err(NdiError::Sdk(e.to_string())),
            }),
        }))
    }
}

type CaptureFn<'a> = Box<dyn FnMut(Duration) -> Result<Captured, NdiError> + 'a>;

/// An open SDK receiver. The receiver lives inside the capture closure.
struct SdkSource<'a> {
    name: String,
    capture: CaptureFn<'a>,
}

impl FrameSource for SdkSource<'_> {
    fn capture(&mut self, timeout: Duration) -> Result<Captured, NdiError> {
        (self.capture)(timeout)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
