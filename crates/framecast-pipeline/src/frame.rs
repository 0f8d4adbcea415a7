//! Decoded frame types passed between decoders, frame hooks, and encoders.

use bytes::Bytes;

/// Pixel format of a decoded video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0 (Y, U, V planes).
    #[default]
    I420,
    /// Planar Y + interleaved UV 4:2:0.
    Nv12,
    /// Packed RGBA, 8 bits per channel.
    Rgba,
}

impl PixelFormat {
    /// Expected buffer size for the given dimensions.
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::I420 | Self::Nv12 => pixels + pixels / 2,
            Self::Rgba => pixels * 4,
        }
    }
}

/// A decoded video picture.
///
/// Frames are reference-counted through [`Bytes`]; cloning shares the pixel
/// buffer. A frame exists only between decoder output and encoder submission.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
    /// Presentation timestamp in microseconds.
    pub timestamp_micros: i64,
    pub duration_micros: u32,
}

/// A decoded PCM audio buffer.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub channels: u32,
    pub sample_rate: u32,
    /// Interleaved f32 samples.
    pub data: Bytes,
    /// Presentation timestamp in microseconds.
    pub timestamp_micros: i64,
    pub duration_micros: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sizes() {
        assert_eq!(PixelFormat::I420.buffer_size(4, 4), 24);
        assert_eq!(PixelFormat::Nv12.buffer_size(4, 4), 24);
        assert_eq!(PixelFormat::Rgba.buffer_size(4, 4), 64);
    }

    #[test]
    fn frame_clone_shares_buffer() {
        let frame = VideoFrame {
            width: 2,
            height: 2,
            format: PixelFormat::I420,
            data: Bytes::from(vec![0u8; 6]),
            timestamp_micros: 0,
            duration_micros: 33_333,
        };
        let other = frame.clone();
        // Bytes clones share the underlying allocation.
        assert_eq!(frame.data.as_ptr(), other.data.as_ptr());
    }
}
