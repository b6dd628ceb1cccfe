//! Network subsystem for encoded frame transport over TCP

pub mod runtime;
pub mod session;
pub mod socket;
pub mod transmitter;

pub use runtime::{RuntimeLease, SystemSockets, TransportLibrary, TransportRuntime};
pub use session::{AcceptOutcome, SessionState, TransportSession};
pub use socket::BandwidthLimiter;
pub use transmitter::{FrameTransmitter, TransmitterEvent, TransmitterStats};
