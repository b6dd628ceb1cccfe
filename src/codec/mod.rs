//! Video codec layer
//!
//! Codec backends and the threaded frame encoder that drives them.

pub mod backend;
pub mod encoder;

pub use backend::{CodecBackend, FrameCodec, JpegPassthrough, UnimplementedH264};
pub use encoder::{EncoderState, EncoderStats, FrameEncoder};
