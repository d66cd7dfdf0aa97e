//! Captured video and audio frames, owned copies of what the SDK handed out.

/// Video pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFormat {
    /// BGRA 8-bit per channel (32 bits per pixel)
    BGRA,
    /// BGRX 8-bit per channel (32 bits per pixel, alpha ignored)
    BGRX,
    /// RGBA 8-bit per channel (32 bits per pixel)
    RGBA,
    /// RGBX 8-bit per channel (32 bits per pixel, alpha ignored)
    RGBX,
    /// UYVY 4:2:2 (16 bits per pixel)
    UYVY,
}

impl VideoFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            VideoFormat::BGRA | VideoFormat::BGRX | VideoFormat::RGBA | VideoFormat::RGBX => 4,
            VideoFormat::UYVY => 2,
        }
    }

    /// Tightly packed line length
    pub fn min_stride(&self, width: u32) -> usize {
        width as usize * self.bytes_per_pixel()
    }
}

/// A received video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: VideoFormat,
    /// Bytes per line; 0 means tightly packed
    pub stride: u32,
    pub data: Vec<u8>,
    /// Frame rate numerator (e.g., 30000 for 29.97fps)
    pub frame_rate_n: u32,
    /// Frame rate denominator (e.g., 1001 for 29.97fps)
    pub frame_rate_d: u32,
}

impl VideoFrame {
    /// Zeroed, tightly packed frame
    pub fn new(width: u32, height: u32, format: VideoFormat) -> Self {
        Self {
            width,
            height,
            format,
            stride: 0,
            data: vec![0u8; format.min_stride(width) * height as usize],
            frame_rate_n: 30000,
            frame_rate_d: 1001,
        }
    }

    /// Effective line length in bytes
    pub fn line_stride(&self) -> usize {
        if self.stride == 0 {
            self.format.min_stride(self.width)
        } else {
            self.stride as usize
        }
    }

    /// Bytes the SDK actually delivered per frame (stride × height)
    pub fn wire_size(&self) -> usize {
        self.line_stride() * self.height as usize
    }

    pub fn frame_rate(&self) -> f64 {
        if self.frame_rate_d == 0 {
            0.0
        } else {
            f64::from(self.frame_rate_n) / f64::from(self.frame_rate_d)
        }
    }

    /// BGRA colour bars: white, yellow, cyan, green, magenta, red, blue, black
    pub fn test_pattern_bars(width: u32, height: u32) -> Self {
        const COLORS: [(u8, u8, u8); 8] = [
            (255, 255, 255),
            (255, 255, 0),
            (0, 255, 255),
            (0, 255, 0),
            (255, 0, 255),
            (255, 0, 0),
            (0, 0, 255),
            (0, 0, 0),
        ];

        let mut frame = Self::new(width, height, VideoFormat::BGRA);
        let bar_width = (width / 8).max(1);
        let stride = frame.line_stride();

        for (y, line) in frame.data.chunks_exact_mut(stride).enumerate() {
            if y >= height as usize {
                break;
            }
            for (x, pixel) in line.chunks_exact_mut(4).enumerate() {
                let (r, g, b) = COLORS[(x as u32 / bar_width).min(7) as usize];
                pixel.copy_from_slice(&[b, g, r, 255]);
            }
        }

        frame
    }
}

/// A received audio frame (interleaved f32)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_channel: u32,
    pub data: Vec<f32>,
}

impl AudioFrame {
    /// Silent frame
    pub fn new(sample_rate: u32, channels: u16, samples_per_channel: u32) -> Self {
        Self {
            sample_rate,
            channels,
            samples_per_channel,
            data: vec![0.0f32; samples_per_channel as usize * channels as usize],
        }
    }
}

/// Display-ready packed RGB image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImage {
    pub width: u32,
    pub height: u32,
    /// `width * height * 3` bytes, row-major
    pub data: Vec<u8>,
}

impl RgbImage {
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_defaults_to_packed() {
        let mut frame = VideoFrame::new(1920, 1080, VideoFormat::UYVY);
        assert_eq!(frame.line_stride(), 3840);
        assert_eq!(frame.data.len(), 3840 * 1080);

        frame.stride = 4096;
        assert_eq!(frame.wire_size(), 4096 * 1080);
    }

    #[test]
    fn test_frame_rate() {
        let frame = VideoFrame::new(16, 16, VideoFormat::BGRA);
        assert!((frame.frame_rate() - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_bars() {
        let frame = VideoFrame::test_pattern_bars(80, 2);
        // first bar white, second yellow (BGRA)
        assert_eq!(&frame.data[0..4], &[255, 255, 255, 255]);
        assert_eq!(&frame.data[40..44], &[0, 255, 255, 255]);
        // last bar black
        assert_eq!(&frame.data[79 * 4..80 * 4], &[0, 0, 0, 255]);
    }
}
