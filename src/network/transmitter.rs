//! Frame transmitter
//!
//! Owns a [`TransportSession`] on a background thread. Callers queue
//! encoded frames with [`FrameTransmitter::transmit_frame`] and observe
//! progress through the event channel.

use bytes::Bytes;
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::TransmitterSettings;
use crate::constants::IDLE_POLL_MS;
use crate::events::EventSink;
use crate::error::TransportError;
use crate::network::runtime::TransportRuntime;
use crate::network::session::{AcceptOutcome, SessionState, SharedState, TransportSession};
use crate::video::FrameQueue;

/// Notifications from the transmit thread
#[derive(Debug, Clone, PartialEq)]
pub enum TransmitterEvent {
    StateChanged(SessionState),
    /// A frame was fully written to the client
    FrameTransmitted(Bytes),
    Error(String),
}

/// Transmitter statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransmitterStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    /// Frames evicted from the outbound queue
    pub frames_dropped: u64,
    pub send_failures: u64,
    /// Clients accepted over the lifetime of the transmitter
    pub connections: u64,
}

struct WorkerHandle {
    thread: JoinHandle<TransportSession>,
    stop_tx: Sender<()>,
    cancel: Arc<AtomicBool>,
}

/// Serves queued frames to one client at a time
pub struct FrameTransmitter {
    settings: TransmitterSettings,
    runtime: Arc<TransportRuntime>,
    state: SharedState,
    outbound: Arc<FrameQueue<Bytes>>,
    events: EventSink<TransmitterEvent>,
    stats: Arc<Mutex<TransmitterStats>>,
    local_addr: Option<SocketAddr>,
    worker: Option<WorkerHandle>,
}

impl FrameTransmitter {
    pub fn new(settings: TransmitterSettings, runtime: Arc<TransportRuntime>) -> Self {
        let outbound = Arc::new(FrameQueue::new(settings.outbound_capacity));

        Self {
            settings,
            runtime,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            outbound,
            events: EventSink::new(),
            stats: Arc::new(Mutex::new(TransmitterStats::default())),
            local_addr: None,
            worker: None,
        }
    }

    /// Bind, listen and start the transmit thread
    ///
    /// Failures are also reported as [`TransmitterEvent::Error`].
    pub fn start_transmission(&mut self) -> Result<(), TransportError> {
        if self.is_transmitting() {
            return Err(TransportError::AlreadyActive);
        }
        // A worker that gave up on its own still needs joining.
        self.reap_worker();

        let session =
            match TransportSession::open(self.settings.clone(), &self.runtime, self.state.clone()) {
                Ok(session) => session,
                Err(e) => {
                    tracing::error!("Failed to start transmission: {}", e);
                    self.emit(TransmitterEvent::Error(e.to_string()));
                    return Err(e);
                }
            };

        self.local_addr = session.local_addr();
        self.rebuild_outbound();
        self.emit(TransmitterEvent::StateChanged(SessionState::Listening));

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let worker = TransmitWorker {
            session,
            outbound: self.outbound.receiver(),
            stop: stop_rx,
            cancel: cancel.clone(),
            events: self.events.clone(),
            stats: self.stats.clone(),
            accept_interval: self.settings.accept_interval(),
            reported: SessionState::Listening,
        };

        // On spawn failure the worker, and with it the session, is dropped and closed.
        let thread = match thread::Builder::new()
            .name("frame-transmitter".to_string())
            .spawn(move || worker.run())
        {
            Ok(thread) => thread,
            Err(e) => {
                let err = TransportError::ThreadSpawn(e.to_string());
                tracing::error!("Failed to spawn transmit thread: {}", e);
                self.emit(TransmitterEvent::Error(err.to_string()));
                self.emit(TransmitterEvent::StateChanged(SessionState::Closed));
                return Err(err);
            }
        };

        self.worker = Some(WorkerHandle {
            thread,
            stop_tx,
            cancel,
        });

        tracing::info!(
            "Started transmission on {}",
            self.local_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| format!("port {}", self.settings.port))
        );
        Ok(())
    }

    /// Stop the transmit thread and close the session
    ///
    /// Safe to call repeatedly.
    pub fn stop_transmission(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        worker.cancel.store(true, Ordering::Release);
        drop(worker.stop_tx);

        let previous = match worker.thread.join() {
            Ok(mut session) => {
                let previous = session.state();
                session.close();
                previous
            }
            Err(_) => {
                tracing::error!("Transmit thread panicked");
                let mut state = self.state.lock();
                let previous = *state;
                *state = SessionState::Closed;
                previous
            }
        };

        let discarded = self.outbound.clear();
        if discarded > 0 {
            tracing::debug!("Discarded {} queued frame(s) on stop", discarded);
        }

        if previous != SessionState::Closed {
            self.emit(TransmitterEvent::StateChanged(SessionState::Closed));
        }
        tracing::info!("Stopped transmission");
    }

    /// Queue one encoded frame; never blocks
    ///
    /// Accepted while the session is listening or connected. Frames
    /// queued before a client connects are delivered to it, oldest first,
    /// subject to the queue bound.
    pub fn transmit_frame(&self, frame: impl Into<Bytes>) -> Result<(), TransportError> {
        if !self.is_transmitting() {
            return Err(TransportError::NotActive);
        }

        let evicted = self.outbound.push(frame.into());
        if evicted > 0 {
            tracing::trace!("Outbound queue full, dropped {} frame(s)", evicted);
        }
        Ok(())
    }

    /// Store new settings; they apply on the next start
    pub fn update_settings(&mut self, settings: TransmitterSettings) {
        self.settings = settings;
    }

    pub fn settings(&self) -> &TransmitterSettings {
        &self.settings
    }

    pub fn is_transmitting(&self) -> bool {
        self.worker.is_some() && self.state().is_active()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Address the current or most recent session listened on
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Event stream; every clone competes for the same events
    pub fn events(&self) -> Receiver<TransmitterEvent> {
        self.events.receiver()
    }

    pub fn queued_frames(&self) -> usize {
        self.outbound.len()
    }

    pub fn stats(&self) -> TransmitterStats {
        let mut stats = self.stats.lock().clone();
        stats.frames_dropped += self.outbound.dropped();
        stats
    }

    /// Fresh outbound queue sized from the current settings
    fn rebuild_outbound(&mut self) {
        let previous = std::mem::replace(
            &mut self.outbound,
            Arc::new(FrameQueue::new(self.settings.outbound_capacity)),
        );
        self.stats.lock().frames_dropped += previous.dropped();
    }

    fn reap_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            drop(worker.stop_tx);
            if worker.thread.join().is_err() {
                tracing::error!("Transmit thread panicked");
            }
        }
    }

    fn emit(&self, event: TransmitterEvent) {
        self.events.emit(event);
    }
}

impl Drop for FrameTransmitter {
    fn drop(&mut self) {
        self.stop_transmission();
    }
}

/// State owned by the transmit thread
struct TransmitWorker {
    session: TransportSession,
    outbound: Receiver<Bytes>,
    stop: Receiver<()>,
    cancel: Arc<AtomicBool>,
    events: EventSink<TransmitterEvent>,
    stats: Arc<Mutex<TransmitterStats>>,
    accept_interval: Duration,
    /// Last state announced through the event channel
    reported: SessionState,
}

impl TransmitWorker {
    fn run(mut self) -> TransportSession {
        tracing::debug!("Transmit thread started");
        let stop = self.stop.clone();
        let outbound = self.outbound.clone();

        while !self.cancelled() {
            if !self.session.is_connected() {
                if !self.accept_once() {
                    break;
                }
                if self.session.is_connected() {
                    continue;
                }
                match stop.recv_timeout(self.accept_interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            }

            select! {
                recv(stop) -> _ => break,
                recv(outbound) -> frame => match frame {
                    Ok(frame) => {
                        if !self.deliver(frame, &stop) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                default(Duration::from_millis(IDLE_POLL_MS)) => {}
            }
        }

        tracing::debug!("Transmit thread stopped");
        self.session
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// One accept attempt; false once the session has given up
    fn accept_once(&mut self) -> bool {
        match self.session.try_accept() {
            Ok(AcceptOutcome::Connected(_)) => {
                self.stats.lock().connections += 1;
                self.report_state();
                true
            }
            Ok(AcceptOutcome::Pending { .. }) => true,
            Ok(AcceptOutcome::Failed { error, .. }) => {
                tracing::warn!("Accept failed: {}", error);
                self.events.emit(TransmitterEvent::Error(error.to_string()));
                true
            }
            Ok(AcceptOutcome::Exhausted { attempts }) => {
                let err = TransportError::RetryExhausted { attempts };
                tracing::error!("{}", err);
                self.events.emit(TransmitterEvent::Error(err.to_string()));
                self.report_state();
                false
            }
            Err(e) => {
                self.events.emit(TransmitterEvent::Error(e.to_string()));
                self.report_state();
                false
            }
        }
    }

    /// Pace and send one frame; false when a stop arrived while pacing
    fn deliver(&mut self, frame: Bytes, stop: &Receiver<()>) -> bool {
        let delay = self.session.pacing_delay(frame.len());
        if !delay.is_zero() {
            match stop.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return false,
            }
        }

        match self.session.send(&frame) {
            Ok(()) => {
                {
                    let mut stats = self.stats.lock();
                    stats.frames_sent += 1;
                    stats.bytes_sent += frame.len() as u64;
                }
                self.events.emit_lossy(TransmitterEvent::FrameTransmitted(frame));
            }
            Err(e) => {
                self.stats.lock().send_failures += 1;
                self.events.emit(TransmitterEvent::Error(e.to_string()));
                self.report_state();
            }
        }
        true
    }

    fn report_state(&mut self) {
        let state = self.session.state();
        if state != self.reported {
            self.reported = state;
            self.events.emit(TransmitterEvent::StateChanged(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::runtime::tests::CountingLibrary;
    use std::io::Read;
    use std::net::TcpStream;
    use std::sync::Barrier;
    use std::time::Instant;

    fn loopback(attempts: u32) -> TransmitterSettings {
        TransmitterSettings {
            bind_address: "127.0.0.1".into(),
            port: 0,
            reconnect_attempts: attempts,
            accept_interval_ms: 5,
            ..TransmitterSettings::default()
        }
    }

    fn wait_for_event(
        events: &Receiver<TransmitterEvent>,
        mut matches: impl FnMut(&TransmitterEvent) -> bool,
    ) -> Option<TransmitterEvent> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match events.recv_timeout(left) {
                Ok(event) if matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn connect(transmitter: &FrameTransmitter) -> TcpStream {
        let client = TcpStream::connect(transmitter.local_addr().unwrap()).unwrap();
        assert!(wait_until(|| transmitter.state() == SessionState::Connected));
        client
    }

    #[test]
    fn test_transmit_before_start_fails() {
        let transmitter = FrameTransmitter::new(loopback(10), TransportRuntime::new());
        assert_eq!(transmitter.state(), SessionState::Idle);
        assert_eq!(
            transmitter.transmit_frame(vec![0u8; 10]),
            Err(TransportError::NotActive)
        );
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut transmitter = FrameTransmitter::new(loopback(1000), TransportRuntime::new());
        transmitter.start_transmission().unwrap();
        assert_eq!(transmitter.start_transmission(), Err(TransportError::AlreadyActive));
        assert!(transmitter.is_transmitting());
    }

    #[test]
    fn test_bind_failure_stays_idle() {
        let settings = TransmitterSettings {
            bind_address: "not-an-address".into(),
            ..loopback(10)
        };
        let mut transmitter = FrameTransmitter::new(settings, TransportRuntime::new());
        let events = transmitter.events();

        assert!(matches!(
            transmitter.start_transmission(),
            Err(TransportError::Bind(_))
        ));
        assert_eq!(transmitter.state(), SessionState::Idle);
        assert!(!transmitter.is_transmitting());
        assert!(matches!(events.try_recv(), Ok(TransmitterEvent::Error(_))));
    }

    #[test]
    fn test_retry_exhaustion_closes_session() {
        let mut transmitter = FrameTransmitter::new(loopback(3), TransportRuntime::new());
        let events = transmitter.events();
        transmitter.start_transmission().unwrap();

        let exhausted = wait_for_event(&events, |e| matches!(e, TransmitterEvent::Error(_)));
        assert_eq!(
            exhausted,
            Some(TransmitterEvent::Error(
                TransportError::RetryExhausted { attempts: 3 }.to_string()
            ))
        );
        assert_eq!(
            wait_for_event(&events, |e| matches!(e, TransmitterEvent::StateChanged(_))),
            Some(TransmitterEvent::StateChanged(SessionState::Closed))
        );

        assert!(!transmitter.is_transmitting());
        assert_eq!(transmitter.state(), SessionState::Closed);
        assert_eq!(
            transmitter.transmit_frame(vec![1u8]),
            Err(TransportError::NotActive)
        );

        // A fresh start works after exhaustion.
        transmitter.start_transmission().unwrap();
        assert!(transmitter.is_transmitting());
    }

    #[test]
    fn test_frame_reaches_client() {
        let mut transmitter = FrameTransmitter::new(loopback(1000), TransportRuntime::new());
        let events = transmitter.events();
        transmitter.start_transmission().unwrap();
        let mut client = connect(&transmitter);

        let frame: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        transmitter.transmit_frame(frame.clone()).unwrap();

        let mut received = vec![0u8; 1000];
        client.read_exact(&mut received).unwrap();
        assert_eq!(received, frame);

        let sent = wait_for_event(&events, |e| matches!(e, TransmitterEvent::FrameTransmitted(_)));
        assert_eq!(sent, Some(TransmitterEvent::FrameTransmitted(Bytes::from(frame))));

        thread::sleep(Duration::from_millis(50));
        assert!(events
            .try_iter()
            .all(|e| !matches!(e, TransmitterEvent::FrameTransmitted(_))));

        let stats = transmitter.stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.bytes_sent, 1000);
        assert_eq!(stats.connections, 1);
    }

    #[test]
    fn test_frames_arrive_in_order() {
        let mut transmitter = FrameTransmitter::new(loopback(1000), TransportRuntime::new());
        transmitter.start_transmission().unwrap();
        let mut client = connect(&transmitter);

        for i in 0..10u8 {
            transmitter.transmit_frame(vec![i; 100]).unwrap();
        }

        let mut received = vec![0u8; 1000];
        client.read_exact(&mut received).unwrap();
        for (i, chunk) in received.chunks(100).enumerate() {
            assert!(chunk.iter().all(|b| *b == i as u8));
        }
    }

    #[test]
    fn test_client_drop_then_reconnect() {
        let mut transmitter = FrameTransmitter::new(loopback(100_000), TransportRuntime::new());
        let events = transmitter.events();
        transmitter.start_transmission().unwrap();

        let client = connect(&transmitter);
        drop(client);

        // Keep sending until the broken connection is noticed.
        assert!(wait_until(|| {
            let _ = transmitter.transmit_frame(vec![0u8; 64 * 1024]);
            transmitter.state() == SessionState::WaitingForClient
        }));
        assert!(wait_for_event(&events, |e| matches!(e, TransmitterEvent::Error(_))).is_some());
        assert!(transmitter.is_transmitting());
        assert!(transmitter.stats().send_failures >= 1);

        // No restart needed for the next client.
        let mut client = connect(&transmitter);
        transmitter.outbound.clear();
        transmitter.transmit_frame(vec![9u8; 16]).unwrap();

        let mut buf = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(10);
        client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        // Earlier queued frames may precede ours; read until the marker shows up.
        loop {
            client.read_exact(&mut buf[..1]).unwrap();
            if buf[0] == 9 || Instant::now() > deadline {
                break;
            }
        }
        assert_eq!(buf[0], 9);
        assert_eq!(transmitter.stats().connections, 2);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut transmitter = FrameTransmitter::new(loopback(1000), TransportRuntime::new());
        let events = transmitter.events();
        transmitter.start_transmission().unwrap();
        transmitter.transmit_frame(vec![0u8; 10]).unwrap();

        transmitter.stop_transmission();
        transmitter.stop_transmission();

        assert_eq!(transmitter.state(), SessionState::Closed);
        assert!(!transmitter.is_transmitting());
        assert_eq!(transmitter.queued_frames(), 0);

        let closed: Vec<_> = events
            .try_iter()
            .filter(|e| *e == TransmitterEvent::StateChanged(SessionState::Closed))
            .collect();
        assert_eq!(closed.len(), 1);
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let mut transmitter = FrameTransmitter::new(loopback(10), TransportRuntime::new());
        let events = transmitter.events();
        transmitter.stop_transmission();
        assert_eq!(transmitter.state(), SessionState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_outbound_queue_drops_oldest() {
        let settings = TransmitterSettings {
            outbound_capacity: 4,
            ..loopback(100_000)
        };
        let mut transmitter = FrameTransmitter::new(settings, TransportRuntime::new());
        transmitter.start_transmission().unwrap();

        // No client: frames pile up and the oldest are evicted.
        for i in 0..10u8 {
            transmitter.transmit_frame(vec![i]).unwrap();
        }
        assert_eq!(transmitter.queued_frames(), 4);
        assert_eq!(transmitter.stats().frames_dropped, 6);
    }

    #[test]
    fn test_concurrent_starts_share_one_runtime() {
        let library = CountingLibrary::default();
        let runtime = TransportRuntime::with_library(library.clone());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let runtime = runtime.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut transmitter = FrameTransmitter::new(loopback(100_000), runtime);
                    barrier.wait();
                    transmitter.start_transmission().unwrap();
                    thread::sleep(Duration::from_millis(20));
                    transmitter.stop_transmission();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(library.startups.load(Ordering::SeqCst), 1);
        assert_eq!(library.cleanups.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.active_sessions(), 0);
    }

    #[test]
    fn test_update_settings_applies_on_next_start() {
        let mut transmitter = FrameTransmitter::new(loopback(1000), TransportRuntime::new());
        transmitter.start_transmission().unwrap();
        let first = transmitter.local_addr().unwrap();

        let new_settings = TransmitterSettings {
            latency_ms: 0,
            ..loopback(1000)
        };
        transmitter.update_settings(new_settings.clone());
        assert_eq!(transmitter.local_addr(), Some(first));

        transmitter.stop_transmission();
        transmitter.start_transmission().unwrap();
        assert_eq!(transmitter.settings(), &new_settings);
        assert!(transmitter.is_transmitting());
    }

    #[test]
    fn test_outbound_capacity_follows_updated_settings() {
        let mut transmitter = FrameTransmitter::new(loopback(100_000), TransportRuntime::new());
        transmitter.update_settings(TransmitterSettings {
            outbound_capacity: 4,
            ..loopback(100_000)
        });
        transmitter.start_transmission().unwrap();

        for i in 0..10u8 {
            transmitter.transmit_frame(vec![i]).unwrap();
        }
        assert_eq!(transmitter.queued_frames(), 4);
        assert_eq!(transmitter.stats().frames_dropped, 6);

        // Drops from an earlier session stay counted after a restart.
        transmitter.stop_transmission();
        transmitter.start_transmission().unwrap();
        transmitter.transmit_frame(vec![0u8]).unwrap();
        assert_eq!(transmitter.stats().frames_dropped, 6);
    }

    #[test]
    fn test_exhaustion_reported_with_undrained_frame_events() {
        let settings = TransmitterSettings {
            outbound_capacity: 512,
            ..loopback(50)
        };
        let mut transmitter = FrameTransmitter::new(settings, TransportRuntime::new());
        let events = transmitter.events();
        transmitter.start_transmission().unwrap();

        let client = connect(&transmitter);
        for _ in 0..300 {
            transmitter.transmit_frame(vec![1u8; 100]).unwrap();
        }
        assert!(wait_until(|| transmitter.stats().frames_sent == 300));
        drop(client);

        assert!(wait_until(|| {
            let _ = transmitter.transmit_frame(vec![0u8; 64 * 1024]);
            transmitter.state() != SessionState::Connected
        }));

        // The state flips before the worker announces it.
        let mut received = Vec::new();
        assert!(wait_until(|| {
            received.extend(events.try_iter());
            received.last() == Some(&TransmitterEvent::StateChanged(SessionState::Closed))
        }));
        assert_eq!(transmitter.state(), SessionState::Closed);
        assert_eq!(
            received.last(),
            Some(&TransmitterEvent::StateChanged(SessionState::Closed))
        );
        assert!(received.contains(&TransmitterEvent::Error(
            TransportError::RetryExhausted { attempts: 50 }.to_string()
        )));
        assert!(received
            .iter()
            .any(|e| matches!(e, TransmitterEvent::FrameTransmitted(_))));
    }
}
