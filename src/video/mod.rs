//! Frame types and queues shared by the encoder and the transmitter

pub mod frame;
pub mod queue;

pub use frame::{EncodedFrame, PixelFormat, RawFrame};
pub use queue::FrameQueue;
