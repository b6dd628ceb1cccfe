//! Transport session state machine
//!
//! One listening socket and at most one connected client:
//!
//! ```text
//! Idle ──open──► Listening ──accept──► Connected
//!                    │                   │  ▲
//!                    │            send   │  │ accept
//!                    │            error  ▼  │
//!                    │             WaitingForClient
//!                    │                   │
//!                    └──── retries exhausted / close ──► Closed
//! ```

use parking_lot::Mutex;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::TransmitterSettings;
use crate::constants::ACCEPT_LOG_EVERY;
use crate::error::TransportError;
use crate::network::runtime::{RuntimeLease, TransportRuntime};
use crate::network::socket::{configure_client, create_listener, BandwidthLimiter};

/// Observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Listening,
    WaitingForClient,
    Connected,
    Closed,
}

impl SessionState {
    /// Whether the session is accepting or serving a client
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Listening | SessionState::WaitingForClient | SessionState::Connected
        )
    }
}

/// State cell shared between a session and its owner
pub type SharedState = Arc<Mutex<SessionState>>;

/// Result of one accept attempt
#[derive(Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    Connected(SocketAddr),
    /// No client yet
    Pending { attempts: u32 },
    /// Accept errored; the session keeps listening
    Failed { attempts: u32, error: TransportError },
    /// Retry ceiling reached; the session is closed
    Exhausted { attempts: u32 },
}

/// Client link; a stream exists only while connected
enum Link {
    Waiting,
    Connected { stream: TcpStream, peer: SocketAddr },
}

/// One listening socket serving at most one client
pub struct TransportSession {
    settings: TransmitterSettings,
    listener: Option<TcpListener>,
    link: Link,
    state: SharedState,
    attempts: u32,
    limiter: BandwidthLimiter,
    _lease: RuntimeLease,
}

impl TransportSession {
    /// Start the runtime, then bind and listen
    ///
    /// On failure nothing stays open and `state` is left untouched.
    pub fn open(
        settings: TransmitterSettings,
        runtime: &Arc<TransportRuntime>,
        state: SharedState,
    ) -> Result<Self, TransportError> {
        let lease = runtime.ensure_started()?;
        let listener = create_listener(&settings)?;

        match listener.local_addr() {
            Ok(addr) => tracing::info!("Listening for a client on {}", addr),
            Err(_) => tracing::info!("Listening for a client on port {}", settings.port),
        }

        let limiter = BandwidthLimiter::new(settings.bandwidth_cap());
        let mut session = Self {
            settings,
            listener: Some(listener),
            link: Link::Waiting,
            state,
            attempts: 0,
            limiter,
            _lease: lease,
        };
        session.transition(SessionState::Listening);
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.link {
            Link::Connected { peer, .. } => Some(*peer),
            Link::Waiting => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.link, Link::Connected { .. })
    }

    /// Consecutive failed accept attempts
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Try once to accept a client
    pub fn try_accept(&mut self) -> Result<AcceptOutcome, TransportError> {
        if let Link::Connected { peer, .. } = &self.link {
            return Ok(AcceptOutcome::Connected(*peer));
        }
        let Some(listener) = self.listener.as_ref() else {
            return Err(TransportError::NotActive);
        };

        let error = match listener.accept() {
            Ok((stream, peer)) => match configure_client(&stream, &self.settings) {
                Ok(()) => {
                    tracing::info!("Client connected from {}", peer);
                    self.attempts = 0;
                    self.link = Link::Connected { stream, peer };
                    self.transition(SessionState::Connected);
                    return Ok(AcceptOutcome::Connected(peer));
                }
                Err(e) => Some(TransportError::Accept(format!(
                    "failed to configure client {}: {}",
                    peer, e
                ))),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => Some(TransportError::Accept(e.to_string())),
        };

        self.attempts += 1;
        let attempts = self.attempts;

        if attempts >= self.settings.reconnect_attempts {
            tracing::warn!("No client after {} attempts, closing session", attempts);
            self.close();
            return Ok(AcceptOutcome::Exhausted { attempts });
        }

        if attempts % ACCEPT_LOG_EVERY == 0 {
            tracing::info!(
                "Waiting for client ({}/{})",
                attempts,
                self.settings.reconnect_attempts
            );
        }

        Ok(match error {
            Some(error) => AcceptOutcome::Failed { attempts, error },
            None => AcceptOutcome::Pending { attempts },
        })
    }

    /// Write one frame to the client
    ///
    /// A failed write drops the client and returns to waiting; the
    /// listener stays open.
    pub fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let Link::Connected { stream, .. } = &mut self.link else {
            return Err(TransportError::NotActive);
        };

        match stream.write_all(data) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!("Failed to send frame data: {}", e);
                self.disconnect_client();
                Err(TransportError::Send(e.to_string()))
            }
        }
    }

    /// How long to wait before sending `len` bytes under the bandwidth cap
    pub fn pacing_delay(&mut self, len: usize) -> Duration {
        self.limiter.reserve(len, Instant::now())
    }

    /// Drop the client connection and go back to waiting
    pub fn disconnect_client(&mut self) {
        if let Link::Connected { peer, .. } = std::mem::replace(&mut self.link, Link::Waiting) {
            tracing::info!("Client {} disconnected", peer);
            self.transition(SessionState::WaitingForClient);
        }
    }

    /// Close client and listener; terminal
    pub fn close(&mut self) {
        self.link = Link::Waiting;
        self.listener = None;
        self.transition(SessionState::Closed);
    }

    fn transition(&mut self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!("Session state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if self.state().is_active() {
            self.close();
        }
    }
}
