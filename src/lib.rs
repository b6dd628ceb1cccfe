//! # Frame Streamer
//!
//! Real-time media-frame pipeline: raw captured pixel buffers are encoded
//! on a dedicated worker thread and pushed to a single downstream client
//! over a low-latency TCP session.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               HOST PROCESS                               │
//! │   capture collaborator (camera / render target / test pattern)           │
//! │         │ RawFrame (bytes + width + height + pixel format)               │
//! │         ▼                                                                │
//! │  ┌────────────────────────────────────────────────────────────────────┐  │
//! │  │              Stream Pipeline (pipeline::StreamPipeline)            │  │
//! │  │                                                                    │  │
//! │  │  ┌──────────────────────────┐      ┌───────────────────────────┐   │  │
//! │  │  │ FrameEncoder             │      │ FrameTransmitter          │   │  │
//! │  │  │  input queue (drop-old)  │      │  outbound queue (drop-old)│   │  │
//! │  │  │        │                 │      │        │                  │   │  │
//! │  │  │        ▼                 │      │        ▼                  │   │  │
//! │  │  │  ┌───────────┐           │      │  ┌───────────┐            │   │  │
//! │  │  │  │  Encode   │──┐        │      │  │ Transmit  │            │   │  │
//! │  │  │  │  Thread   │  │ JPEG   │ poll │  │  Thread   │            │   │  │
//! │  │  │  └───────────┘  ▼        │ ───► │  └─────┬─────┘            │   │  │
//! │  │  │          output queue    │      │        │ TransportSession │   │  │
//! │  │  └──────────────────────────┘      └────────┼──────────────────┘   │  │
//! │  └─────────────────────────────────────────────┼──────────────────────┘  │
//! │                     TransportRuntime (shared)  │                         │
//! └────────────────────────────────────────────────┼─────────────────────────┘
//!                                                  │ TCP, one client,
//!                                                  ▼ back-to-back JPEGs
//!                                         downstream viewer
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod pipeline;
pub mod video;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Pending raw frames the encoder holds before dropping the oldest
    pub const ENCODER_INPUT_CAPACITY: usize = 5;

    /// Default pending encoded frames the transmitter holds before dropping the oldest
    pub const DEFAULT_OUTBOUND_CAPACITY: usize = 30;

    /// Default listening port
    pub const DEFAULT_PORT: u16 = 9001;

    /// Default bind address (all interfaces)
    pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

    /// Consecutive failed accept attempts before a session gives up
    pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 10;

    /// Pause between accept attempts in milliseconds
    pub const DEFAULT_ACCEPT_INTERVAL_MS: u64 = 1000;

    /// Default latency tolerance in milliseconds
    pub const DEFAULT_LATENCY_MS: u32 = 120;

    /// Default bandwidth overhead in percent
    pub const DEFAULT_OVERHEAD_PERCENT: u32 = 25;

    /// How long the transmit worker waits for a frame before re-checking its state
    pub const IDLE_POLL_MS: u64 = 5;

    /// Accepted bitrate range in Kbps
    pub const MIN_BITRATE_KBPS: u32 = 500;
    pub const MAX_BITRATE_KBPS: u32 = 50_000;

    /// Accepted frame-rate range
    pub const MIN_FPS: u32 = 1;
    pub const MAX_FPS: u32 = 120;

    /// Largest configurable frame width or height
    pub const MAX_FRAME_DIMENSION: u32 = 16_384;

    /// Notification channel capacity
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;

    /// Event slots frame notifications may not use, kept for state and error events
    pub const EVENT_RESERVED_SLOTS: usize = 32;

    /// Only every Nth accept attempt is logged
    pub const ACCEPT_LOG_EVERY: u32 = 5;

    /// Only every Nth encoded frame is logged
    pub const ENCODE_LOG_EVERY: u64 = 30;
}
