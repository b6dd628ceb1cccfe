//! Raw and encoded video frames

use bytes::Bytes;
use std::time::Duration;

/// Pixel layout of a raw frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit blue, green, red, alpha (render-target read-back order)
    Bgra8,
    /// 8-bit red, green, blue, alpha
    Rgba8,
    /// 8-bit red, green, blue
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// Uncompressed frame delivered by the capture side
///
/// Moved into the encoder queue, never copied.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            format,
        }
    }

    /// Buffer length implied by the dimensions and pixel format
    ///
    /// `None` when the dimensions cannot describe an addressable buffer.
    pub fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.format.bytes_per_pixel())
    }

    /// Whether the buffer length matches the dimensions
    pub fn is_well_formed(&self) -> bool {
        self.expected_len() == Some(self.data.len())
    }
}

/// Compressed frame ready for the wire
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Codec bitstream, written to the socket as-is
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Position in the encoder's output order
    pub sequence: u64,
    /// Wall time spent in the codec
    pub encode_time: Duration,
}

impl EncodedFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<EncodedFrame> for Bytes {
    fn from(frame: EncodedFrame) -> Self {
        frame.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_len() {
        let frame = RawFrame::new(vec![0; 640 * 480 * 4], 640, 480, PixelFormat::Bgra8);
        assert_eq!(frame.expected_len(), Some(1_228_800));
        assert!(frame.is_well_formed());

        let short = RawFrame::new(vec![0; 10], 4, 4, PixelFormat::Rgb8);
        assert_eq!(short.expected_len(), Some(48));
        assert!(!short.is_well_formed());
    }

    #[test]
    fn test_expected_len_overflow() {
        let huge = RawFrame::new(vec![0; 16], u32::MAX, u32::MAX, PixelFormat::Bgra8);
        assert_eq!(huge.expected_len(), None);
        assert!(!huge.is_well_formed());
    }
}
