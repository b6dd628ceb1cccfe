//! Socket setup and send pacing
//!
//! Listening sockets are built through socket2 so options can be applied
//! before bind; accepted client sockets get the latency and bandwidth
//! options of the session.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use crate::config::TransmitterSettings;
use crate::error::TransportError;

/// Smallest send buffer used when a bandwidth cap is active
const MIN_SEND_BUFFER: usize = 64 * 1024;
const MAX_SEND_BUFFER: usize = 16 * 1024 * 1024;

/// Create a non-blocking listener that serves one client at a time
pub fn create_listener(settings: &TransmitterSettings) -> Result<TcpListener, TransportError> {
    let addr = settings.socket_addr()?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| TransportError::Bind(format!("socket creation failed: {}", e)))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| TransportError::Bind(format!("SO_REUSEADDR: {}", e)))?;

    if let Some(cap) = settings.bandwidth_cap() {
        let size = send_buffer_size(cap, settings.latency_ms);
        if let Err(e) = socket.set_send_buffer_size(size) {
            tracing::warn!("Failed to set send buffer to {} bytes: {}", size, e);
        }
    }

    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::Bind(format!("{}: {}", addr, e)))?;

    socket
        .listen(1)
        .map_err(|e| TransportError::Listen(e.to_string()))?;

    // Accept attempts are polled so the pause between them can be interrupted.
    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::Listen(e.to_string()))?;

    Ok(socket.into())
}

/// Apply session options to an accepted client socket
pub fn configure_client(stream: &TcpStream, settings: &TransmitterSettings) -> io::Result<()> {
    // Accepted sockets inherit non-blocking mode on some platforms.
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(settings.write_timeout())?;

    if let Some(cap) = settings.bandwidth_cap() {
        SockRef::from(stream).set_send_buffer_size(send_buffer_size(cap, settings.latency_ms))?;
    }
    Ok(())
}

/// Bandwidth-delay product for the cap and latency, clamped to sane bounds
pub fn send_buffer_size(bytes_per_sec: u64, latency_ms: u32) -> usize {
    let bdp = bytes_per_sec.saturating_mul(latency_ms as u64) / 1000;
    (bdp as usize).clamp(MIN_SEND_BUFFER, MAX_SEND_BUFFER)
}

/// Paces writes to stay under a byte rate
#[derive(Debug)]
pub struct BandwidthLimiter {
    bytes_per_sec: Option<u64>,
    next_slot: Option<Instant>,
}

impl BandwidthLimiter {
    /// `None` disables pacing
    pub fn new(bytes_per_sec: Option<u64>) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec.filter(|rate| *rate > 0),
            next_slot: None,
        }
    }

    /// Reserve airtime for `len` bytes and return how long to wait before sending
    pub fn reserve(&mut self, len: usize, now: Instant) -> Duration {
        let Some(rate) = self.bytes_per_sec else {
            return Duration::ZERO;
        };

        let start = match self.next_slot {
            Some(slot) if slot > now => slot,
            _ => now,
        };
        self.next_slot = Some(start + Duration::from_secs_f64(len as f64 / rate as f64));
        start - now
    }

    pub fn is_limited(&self) -> bool {
        self.bytes_per_sec.is_some()
    }
}
