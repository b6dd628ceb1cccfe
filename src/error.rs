//! Error types for the frame streamer

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Config write error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Encoder and codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncoderError {
    #[error("Encoder initialization failed: {0}")]
    Initialization(String),

    #[error("Unsupported codec format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid frame size: expected {expected} bytes, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },

    #[error("Frame too large for codec: {width}x{height}")]
    FrameTooLarge { width: u32, height: u32 },

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Encoder is not initialized")]
    NotInitialized,

    #[error("Failed to spawn encode thread: {0}")]
    ThreadSpawn(String),
}

/// Transport runtime and session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport runtime startup failed: {0}")]
    RuntimeStartup(String),

    #[error("Transport runtime still has {0} active session(s)")]
    RuntimeBusy(usize),

    #[error("Socket bind failed: {0}")]
    Bind(String),

    #[error("Listen failed: {0}")]
    Listen(String),

    #[error("Accept failed: {0}")]
    Accept(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("No client connected after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    #[error("Transmission is not active")]
    NotActive,

    #[error("Transmission already active")]
    AlreadyActive,

    #[error("Failed to spawn transmit thread: {0}")]
    ThreadSpawn(String),
}

impl TransportError {
    /// Failures the session recovers from by retrying or reconnecting
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Accept(_) | TransportError::Send(_))
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
