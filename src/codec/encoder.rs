//! Threaded frame encoder
//!
//! Raw frames are queued by the caller and compressed on a dedicated
//! worker thread; finished frames are polled back without blocking.

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::codec::backend::{CodecBackend, FrameCodec};
use crate::config::EncoderSettings;
use crate::constants::{ENCODER_INPUT_CAPACITY, ENCODE_LOG_EVERY};
use crate::error::EncoderError;
use crate::video::{EncodedFrame, FrameQueue, RawFrame};

/// Encoder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Uninitialized,
    Initialized,
    ShuttingDown,
    Shutdown,
}

/// Encoder statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    /// Frames evicted from the input queue under backpressure
    pub frames_dropped: u64,
    /// Frames the codec rejected
    pub frames_failed: u64,
    /// Running mean of per-frame encode time in seconds
    pub average_encode_time_secs: f64,
    pub total_bytes_encoded: u64,
}

impl EncoderStats {
    /// Fold one successful encode into the counters and running mean
    pub fn record_encode(&mut self, duration: Duration, bytes: usize) {
        self.frames_encoded += 1;
        self.total_bytes_encoded += bytes as u64;
        let n = self.frames_encoded as f64;
        self.average_encode_time_secs += (duration.as_secs_f64() - self.average_encode_time_secs) / n;
    }
}

/// Settings the worker picks up between frames
struct SharedSettings {
    settings: Mutex<EncoderSettings>,
    revision: AtomicU64,
}

impl SharedSettings {
    fn publish(&self, settings: &EncoderSettings) {
        *self.settings.lock() = settings.clone();
        self.revision.fetch_add(1, Ordering::Release);
    }
}

/// Handle to a running encode thread
struct WorkerHandle {
    thread: JoinHandle<CodecBackend>,
    /// Dropped to wake and stop the worker
    stop_tx: Sender<()>,
    cancel: Arc<AtomicBool>,
}

/// Asynchronous frame encoder with a bounded drop-oldest input queue
pub struct FrameEncoder {
    settings: EncoderSettings,
    state: EncoderState,
    input: Arc<FrameQueue<RawFrame>>,
    output_tx: Sender<EncodedFrame>,
    output_rx: Receiver<EncodedFrame>,
    stats: Arc<Mutex<EncoderStats>>,
    shared: Arc<SharedSettings>,
    worker: Option<WorkerHandle>,
    /// Number of successful initializations
    starts: u64,
}

impl FrameEncoder {
    /// Create an encoder; nothing runs until [`initialize`](Self::initialize)
    pub fn new(settings: EncoderSettings) -> Self {
        let (output_tx, output_rx) = unbounded();
        let shared = Arc::new(SharedSettings {
            settings: Mutex::new(settings.clone()),
            revision: AtomicU64::new(0),
        });

        Self {
            settings,
            state: EncoderState::Uninitialized,
            input: Arc::new(FrameQueue::new(ENCODER_INPUT_CAPACITY)),
            output_tx,
            output_rx,
            stats: Arc::new(Mutex::new(EncoderStats::default())),
            shared,
            worker: None,
            starts: 0,
        }
    }

    /// Resolve presets, bring up the codec and start the encode thread
    ///
    /// On failure the encoder stays un-started.
    pub fn initialize(&mut self) -> Result<(), EncoderError> {
        if self.state == EncoderState::Initialized {
            tracing::warn!("Encoder already initialized");
            return Ok(());
        }

        self.settings.apply_quality_preset();
        tracing::info!(
            "Initializing encoder - {}x{}, {} FPS, {} Kbps, {:?}",
            self.settings.width,
            self.settings.height,
            self.settings.target_fps,
            self.settings.bitrate_kbps,
            self.settings.codec_format
        );

        let mut codec = CodecBackend::select(&self.settings);
        if let Err(e) = codec.initialize() {
            tracing::error!("Failed to initialize codec: {}", e);
            return Err(e);
        }

        self.shared.publish(&self.settings);

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let worker = EncodeWorker {
            codec,
            input: self.input.receiver(),
            output: self.output_tx.clone(),
            stop: stop_rx,
            cancel: cancel.clone(),
            stats: self.stats.clone(),
            shared: self.shared.clone(),
            revision: self.shared.revision.load(Ordering::Acquire),
            sequence: 0,
        };

        let thread = thread::Builder::new()
            .name("frame-encoder".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                tracing::error!("Failed to spawn encode thread: {}", e);
                EncoderError::ThreadSpawn(e.to_string())
            })?;

        self.worker = Some(WorkerHandle {
            thread,
            stop_tx,
            cancel,
        });
        self.state = EncoderState::Initialized;
        self.starts += 1;

        tracing::info!("Encoder initialized successfully");
        Ok(())
    }

    /// Queue a raw frame for encoding; never blocks
    ///
    /// When the queue is full the oldest pending frame is dropped.
    pub fn submit_frame(&self, frame: RawFrame) -> Result<(), EncoderError> {
        if self.state != EncoderState::Initialized {
            return Err(EncoderError::NotInitialized);
        }

        let evicted = self.input.push(frame);
        if evicted > 0 {
            tracing::trace!("Encoder input full, dropped {} frame(s)", evicted);
        }
        Ok(())
    }

    /// Pop one finished frame if any is ready
    pub fn get_encoded_frame(&self) -> Option<EncodedFrame> {
        self.output_rx.try_recv().ok()
    }

    /// Store new settings, restarting the worker only when resolution or
    /// codec format changed
    pub fn update_settings(&mut self, new_settings: EncoderSettings) -> Result<(), EncoderError> {
        let mut new_settings = new_settings;
        new_settings.apply_quality_preset();

        let restart = self.settings.requires_restart(&new_settings);
        self.settings = new_settings;

        if self.state != EncoderState::Initialized {
            return Ok(());
        }

        if restart {
            tracing::info!("Encoder resolution or format changed, restarting");
            self.shutdown();
            self.initialize()
        } else {
            self.shared.publish(&self.settings);
            tracing::debug!(
                "Encoder retuned - {} Kbps, JPEG quality {}",
                self.settings.bitrate_kbps,
                self.settings.jpeg_quality
            );
            Ok(())
        }
    }

    /// Stop and join the encode thread, then release the codec
    ///
    /// Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            if self.state == EncoderState::Initialized {
                self.state = EncoderState::Shutdown;
            }
            return;
        };

        self.state = EncoderState::ShuttingDown;
        worker.cancel.store(true, Ordering::Release);
        drop(worker.stop_tx);

        match worker.thread.join() {
            Ok(mut codec) => codec.shutdown(),
            Err(_) => tracing::error!("Encode thread panicked"),
        }

        let discarded = self.input.clear();
        if discarded > 0 {
            tracing::debug!("Discarded {} pending raw frame(s) on shutdown", discarded);
        }

        self.state = EncoderState::Shutdown;
        tracing::info!("Encoder shut down");
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state == EncoderState::Initialized
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// Raw frames waiting for the worker
    pub fn pending_frames(&self) -> usize {
        self.input.len()
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> EncoderStats {
        let mut stats = self.stats.lock().clone();
        stats.frames_dropped = self.input.dropped();
        stats
    }
}

impl Drop for FrameEncoder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the encode thread
struct EncodeWorker {
    codec: CodecBackend,
    input: Receiver<RawFrame>,
    output: Sender<EncodedFrame>,
    stop: Receiver<()>,
    cancel: Arc<AtomicBool>,
    stats: Arc<Mutex<EncoderStats>>,
    shared: Arc<SharedSettings>,
    revision: u64,
    sequence: u64,
}

impl EncodeWorker {
    fn run(mut self) -> CodecBackend {
        tracing::debug!("Encode thread started");
        let input = self.input.clone();
        let stop = self.stop.clone();

        loop {
            select! {
                recv(stop) -> _ => break,
                recv(input) -> frame => match frame {
                    Ok(frame) => self.process(frame),
                    Err(_) => break,
                },
            }

            // Drain whatever queued up while encoding.
            while !self.cancelled() {
                match input.try_recv() {
                    Ok(frame) => self.process(frame),
                    Err(_) => break,
                }
            }

            if self.cancelled() {
                break;
            }
        }

        tracing::debug!("Encode thread stopped");
        self.codec
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn process(&mut self, frame: RawFrame) {
        let revision = self.shared.revision.load(Ordering::Acquire);
        if revision != self.revision {
            let settings = self.shared.settings.lock().clone();
            self.codec.retune(&settings);
            self.revision = revision;
        }

        match self.codec.encode_frame(&frame) {
            Ok(mut encoded) => {
                encoded.sequence = self.sequence;
                self.sequence += 1;

                let frames_encoded = {
                    let mut stats = self.stats.lock();
                    stats.record_encode(encoded.encode_time, encoded.len());
                    stats.frames_encoded
                };

                if frames_encoded % ENCODE_LOG_EVERY == 0 {
                    tracing::trace!(
                        "Encoded frame {}, {} bytes in {:?}",
                        frames_encoded,
                        encoded.len(),
                        encoded.encode_time
                    );
                }

                // The receiving end lives in the encoder, which outlives this thread.
                let _ = self.output.send(encoded);
            }
            Err(e) => {
                let failed = {
                    let mut stats = self.stats.lock();
                    stats.frames_failed += 1;
                    stats.frames_failed
                };
                if failed == 1 || failed % ENCODE_LOG_EVERY == 0 {
                    tracing::warn!("Frame encode failed ({} so far): {}", failed, e);
                }
            }
        }
    }
}
