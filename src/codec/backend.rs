//! Codec backends
//!
//! The set of codecs is closed: [`CodecBackend`] enumerates every
//! implementation and dispatches to it. New hardware encoders are added as
//! new variants.

use bytes::Bytes;
use jpeg_encoder::{ColorType, Encoder};
use std::time::Instant;

use crate::config::{CodecFormat, EncoderSettings};
use crate::error::EncoderError;
use crate::video::{EncodedFrame, PixelFormat, RawFrame};

/// Operations every codec backend provides
pub trait FrameCodec {
    /// Prepare the codec; must succeed before `encode_frame`
    fn initialize(&mut self) -> Result<(), EncoderError>;

    /// Compress one raw frame
    fn encode_frame(&mut self, raw: &RawFrame) -> Result<EncodedFrame, EncoderError>;

    /// Apply settings that do not need a restart (quality, bitrate)
    fn retune(&mut self, settings: &EncoderSettings);

    /// Release codec resources
    fn shutdown(&mut self);

    fn format(&self) -> CodecFormat;
}

/// Per-frame JPEG compression (motion-JPEG)
pub struct JpegPassthrough {
    quality: u8,
    initialized: bool,
}

impl JpegPassthrough {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            initialized: false,
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    fn color_type(format: PixelFormat) -> ColorType {
        match format {
            PixelFormat::Bgra8 => ColorType::Bgra,
            PixelFormat::Rgba8 => ColorType::Rgba,
            PixelFormat::Rgb8 => ColorType::Rgb,
        }
    }
}

impl FrameCodec for JpegPassthrough {
    fn initialize(&mut self) -> Result<(), EncoderError> {
        tracing::debug!("JPEG backend ready, quality {}", self.quality);
        self.initialized = true;
        Ok(())
    }

    fn encode_frame(&mut self, raw: &RawFrame) -> Result<EncodedFrame, EncoderError> {
        if !self.initialized {
            return Err(EncoderError::NotInitialized);
        }

        let too_large = EncoderError::FrameTooLarge {
            width: raw.width,
            height: raw.height,
        };
        let (width, height) = match (u16::try_from(raw.width), u16::try_from(raw.height)) {
            (Ok(w), Ok(h)) => (w, h),
            _ => return Err(too_large),
        };

        let expected = raw.expected_len().ok_or(too_large)?;
        if raw.data.len() != expected || expected == 0 {
            return Err(EncoderError::InvalidFrameSize {
                expected,
                actual: raw.data.len(),
            });
        }

        let started = Instant::now();
        let mut jpeg = Vec::with_capacity(expected / 8);
        Encoder::new(&mut jpeg, self.quality)
            .encode(&raw.data, width, height, Self::color_type(raw.format))
            .map_err(|e| EncoderError::EncodingFailed(e.to_string()))?;

        if jpeg.is_empty() {
            return Err(EncoderError::EncodingFailed("codec produced no output".into()));
        }

        Ok(EncodedFrame {
            data: Bytes::from(jpeg),
            width: raw.width,
            height: raw.height,
            sequence: 0,
            encode_time: started.elapsed(),
        })
    }

    fn retune(&mut self, settings: &EncoderSettings) {
        self.quality = settings.jpeg_quality.clamp(1, 100);
    }

    fn shutdown(&mut self) {
        self.initialized = false;
    }

    fn format(&self) -> CodecFormat {
        CodecFormat::Mjpeg
    }
}

/// Placeholder for an H.264 encoder; every operation fails
pub struct UnimplementedH264;

impl FrameCodec for UnimplementedH264 {
    fn initialize(&mut self) -> Result<(), EncoderError> {
        Err(EncoderError::UnsupportedFormat("H.264 encoding is not implemented".into()))
    }

    fn encode_frame(&mut self, _raw: &RawFrame) -> Result<EncodedFrame, EncoderError> {
        Err(EncoderError::UnsupportedFormat("H.264 encoding is not implemented".into()))
    }

    fn retune(&mut self, _settings: &EncoderSettings) {}

    fn shutdown(&mut self) {}

    fn format(&self) -> CodecFormat {
        CodecFormat::H264
    }
}

/// Closed set of codec implementations
pub enum CodecBackend {
    Jpeg(JpegPassthrough),
    H264(UnimplementedH264),
}

impl CodecBackend {
    /// Backend for exactly `format`, without fallback
    pub fn new(format: CodecFormat, settings: &EncoderSettings) -> Self {
        match format {
            CodecFormat::Mjpeg => CodecBackend::Jpeg(JpegPassthrough::new(settings.jpeg_quality)),
            CodecFormat::H264 => CodecBackend::H264(UnimplementedH264),
        }
    }

    /// Backend for the requested settings, falling back to JPEG for
    /// anything that is not implemented
    pub fn select(settings: &EncoderSettings) -> Self {
        if settings.encoder_type.is_hardware() {
            tracing::warn!(
                "Hardware encoder {:?} not available, using software encoding",
                settings.encoder_type
            );
        }

        match settings.codec_format {
            CodecFormat::Mjpeg => Self::new(CodecFormat::Mjpeg, settings),
            CodecFormat::H264 => {
                tracing::warn!("H.264 encoding is not implemented, falling back to motion-JPEG");
                Self::new(CodecFormat::Mjpeg, settings)
            }
        }
    }

    fn inner(&mut self) -> &mut dyn FrameCodec {
        match self {
            CodecBackend::Jpeg(codec) => codec,
            CodecBackend::H264(codec) => codec,
        }
    }
}

impl FrameCodec for CodecBackend {
    fn initialize(&mut self) -> Result<(), EncoderError> {
        self.inner().initialize()
    }

    fn encode_frame(&mut self, raw: &RawFrame) -> Result<EncodedFrame, EncoderError> {
        self.inner().encode_frame(raw)
    }

    fn retune(&mut self, settings: &EncoderSettings) {
        self.inner().retune(settings)
    }

    fn shutdown(&mut self) {
        self.inner().shutdown()
    }

    fn format(&self) -> CodecFormat {
        match self {
            CodecBackend::Jpeg(codec) => codec.format(),
            CodecBackend::H264(codec) => codec.format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderType;

    fn gradient(width: u32, height: u32) -> RawFrame {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, 128, 255]);
            }
        }
        RawFrame::new(data, width, height, PixelFormat::Bgra8)
    }

    #[test]
    fn test_jpeg_encode_produces_jpeg() {
        let mut codec = JpegPassthrough::new(80);
        codec.initialize().unwrap();

        let frame = gradient(64, 48);
        let encoded = codec.encode_frame(&frame).unwrap();

        assert_eq!(&encoded.data[..3], &[0xFF, 0xD8, 0xFF]);
        assert_eq!(&encoded.data[encoded.len() - 2..], &[0xFF, 0xD9]);
        assert!(encoded.len() < frame.data.len());
        assert_eq!((encoded.width, encoded.height), (64, 48));
    }

    #[test]
    fn test_jpeg_rejects_wrong_size() {
        let mut codec = JpegPassthrough::new(80);
        codec.initialize().unwrap();

        let frame = RawFrame::new(vec![0; 100], 64, 48, PixelFormat::Bgra8);
        let err = codec.encode_frame(&frame).unwrap_err();
        assert_eq!(
            err,
            EncoderError::InvalidFrameSize {
                expected: 64 * 48 * 4,
                actual: 100
            }
        );
    }

    #[test]
    fn test_jpeg_rejects_oversized_dimensions() {
        let mut codec = JpegPassthrough::new(80);
        codec.initialize().unwrap();

        let frame = RawFrame::new(vec![0; 70_000 * 3], 70_000, 1, PixelFormat::Rgb8);
        assert!(matches!(
            codec.encode_frame(&frame),
            Err(EncoderError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_jpeg_rejects_overflowing_header() {
        let mut codec = JpegPassthrough::new(80);
        codec.initialize().unwrap();

        let frame = RawFrame::new(vec![0; 64], u32::MAX, u32::MAX, PixelFormat::Bgra8);
        assert_eq!(
            codec.encode_frame(&frame).unwrap_err(),
            EncoderError::FrameTooLarge {
                width: u32::MAX,
                height: u32::MAX
            }
        );

        // The codec stays usable.
        assert!(codec.encode_frame(&gradient(8, 8)).is_ok());
    }

    #[test]
    fn test_jpeg_requires_initialize() {
        let mut codec = JpegPassthrough::new(80);
        assert_eq!(
            codec.encode_frame(&gradient(8, 8)).unwrap_err(),
            EncoderError::NotInitialized
        );
    }

    #[test]
    fn test_retune_changes_output_size() {
        let mut codec = JpegPassthrough::new(95);
        codec.initialize().unwrap();
        let frame = gradient(128, 128);
        let high = codec.encode_frame(&frame).unwrap().len();

        let settings = EncoderSettings {
            jpeg_quality: 10,
            ..EncoderSettings::default()
        };
        codec.retune(&settings);
        assert_eq!(codec.quality(), 10);
        let low = codec.encode_frame(&frame).unwrap().len();

        assert!(low < high);
    }

    #[test]
    fn test_h264_always_fails() {
        let mut codec = UnimplementedH264;
        assert!(matches!(codec.initialize(), Err(EncoderError::UnsupportedFormat(_))));
        assert!(codec.encode_frame(&gradient(8, 8)).is_err());
    }

    #[test]
    fn test_select_falls_back_to_jpeg() {
        let settings = EncoderSettings {
            codec_format: CodecFormat::H264,
            encoder_type: EncoderType::Nvenc,
            ..EncoderSettings::default()
        };
        let mut backend = CodecBackend::select(&settings);
        assert_eq!(backend.format(), CodecFormat::Mjpeg);
        assert!(backend.initialize().is_ok());

        let exact = CodecBackend::new(CodecFormat::H264, &settings);
        assert_eq!(exact.format(), CodecFormat::H264);
    }
}
