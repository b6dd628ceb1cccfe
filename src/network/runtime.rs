//! Shared transport runtime
//!
//! Brings the underlying socket library up exactly once, no matter how many
//! sessions start concurrently, and keeps it up while any session holds a
//! [`RuntimeLease`]. Stopping one session never tears the library down for
//! the others; cleanup only happens through [`TransportRuntime::shutdown`]
//! or when the runtime itself is dropped.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::TransportError;

/// Process-level startup and cleanup of a socket library
pub trait TransportLibrary: Send + Sync {
    fn startup(&self) -> Result<(), TransportError>;
    fn cleanup(&self);
}

/// Operating-system sockets through `std::net`
///
/// The standard library initializes platform sockets on first use, so
/// startup has nothing to do beyond recording that the gate opened.
pub struct SystemSockets;

impl TransportLibrary for SystemSockets {
    fn startup(&self) -> Result<(), TransportError> {
        tracing::info!("Socket transport initialized");
        Ok(())
    }

    fn cleanup(&self) {
        tracing::info!("Socket transport cleaned up");
    }
}

/// Idempotent, reference-counted gate around a [`TransportLibrary`]
pub struct TransportRuntime {
    library: Box<dyn TransportLibrary>,
    started: Mutex<bool>,
    active: AtomicUsize,
}

static PROCESS_RUNTIME: OnceLock<Arc<TransportRuntime>> = OnceLock::new();

impl TransportRuntime {
    /// Runtime over the operating-system sockets
    pub fn new() -> Arc<Self> {
        Self::with_library(SystemSockets)
    }

    pub fn with_library(library: impl TransportLibrary + 'static) -> Arc<Self> {
        Arc::new(Self {
            library: Box::new(library),
            started: Mutex::new(false),
            active: AtomicUsize::new(0),
        })
    }

    /// Lazily created runtime shared by everything in this process
    pub fn process() -> Arc<Self> {
        PROCESS_RUNTIME.get_or_init(Self::new).clone()
    }

    /// Start the library if needed and take a lease on it
    ///
    /// Concurrent callers serialize on the gate; only the first runs the
    /// library startup.
    pub fn ensure_started(self: &Arc<Self>) -> Result<RuntimeLease, TransportError> {
        {
            let mut started = self.started.lock();
            if !*started {
                self.library.startup()?;
                *started = true;
            }
            self.active.fetch_add(1, Ordering::AcqRel);
        }

        Ok(RuntimeLease {
            runtime: Arc::clone(self),
        })
    }

    pub fn is_started(&self) -> bool {
        *self.started.lock()
    }

    /// Sessions currently holding a lease
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Clean the library up; refused while any session is active
    pub fn shutdown(&self) -> Result<(), TransportError> {
        let mut started = self.started.lock();
        let active = self.active.load(Ordering::Acquire);
        if active > 0 {
            return Err(TransportError::RuntimeBusy(active));
        }
        if *started {
            self.library.cleanup();
            *started = false;
        }
        Ok(())
    }
}

impl Drop for TransportRuntime {
    fn drop(&mut self) {
        if *self.started.get_mut() {
            self.library.cleanup();
        }
    }
}

/// Proof that the runtime is up; released when dropped
pub struct RuntimeLease {
    runtime: Arc<TransportRuntime>,
}

impl RuntimeLease {
    pub fn runtime(&self) -> &Arc<TransportRuntime> {
        &self.runtime
    }
}

impl Drop for RuntimeLease {
    fn drop(&mut self) {
        // Hold the gate so a concurrent shutdown sees a consistent count.
        let _gate = self.runtime.started.lock();
        self.runtime.active.fetch_sub(1, Ordering::AcqRel);
    }
}
