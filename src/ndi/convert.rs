//! Pixel conversion to packed RGB for display.

use super::frame::{RgbImage, VideoFormat, VideoFrame};
use super::NdiError;

/// Convert any supported frame to packed RGB, honouring the line stride.
pub fn to_rgb(frame: &VideoFrame) -> Result<RgbImage, NdiError> {
    let width = frame.width as usize;
    let height = frame.height as usize;
    if width == 0 || height == 0 {
        return Err(NdiError::InvalidFrame(format!("empty frame {}x{}", width, height)));
    }

    let stride = frame.line_stride();
    let line_bytes = match frame.format {
        VideoFormat::UYVY => (width + 1) / 2 * 4,
        format => format.min_stride(frame.width),
    };
    if stride < line_bytes {
        return Err(NdiError::InvalidFrame(format!(
            "stride {} shorter than a {}-pixel line",
            stride, width
        )));
    }
    let needed = stride * (height - 1) + line_bytes;
    if frame.data.len() < needed {
        return Err(NdiError::InvalidFrame(format!(
            "{:?} {}x{} needs {} bytes, got {}",
            frame.format,
            width,
            height,
            needed,
            frame.data.len()
        )));
    }

    let mut out = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let line = &frame.data[y * stride..y * stride + line_bytes];
        match frame.format {
            VideoFormat::BGRA | VideoFormat::BGRX => {
                for px in line.chunks_exact(4) {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
            VideoFormat::RGBA | VideoFormat::RGBX => {
                for px in line.chunks_exact(4) {
                    out.extend_from_slice(&px[..3]);
                }
            }
            VideoFormat::UYVY => {
                for x in 0..width {
                    let base = (x / 2) * 4;
                    let u = line[base];
                    let v = line[base + 2];
                    let luma = line[base + 1 + (x % 2) * 2];
                    out.extend_from_slice(&yuv_to_rgb(luma, u, v));
                }
            }
        }
    }

    Ok(RgbImage {
        width: frame.width,
        height: frame.height,
        data: out,
    })
}

/// BT.601 limited range, 8.8 fixed point
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;

    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;
    [clamp(r), clamp(g), clamp(b)]
}

fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}
