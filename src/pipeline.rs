//! Stream pipeline
//!
//! Wires one [`FrameEncoder`] to one [`FrameTransmitter`]: raw frames go
//! in through [`StreamPipeline::push_frame`], finished frames are forwarded
//! to the transmitter, and transmitter notifications come back out as
//! [`StreamEvent`]s.

use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{EncoderStats, FrameEncoder};
use crate::config::{AppConfig, StreamQuality};
use crate::constants::{MAX_BITRATE_KBPS, MIN_BITRATE_KBPS};
use crate::error::{EncoderError, Result, TransportError};
use crate::events::EventSink;
use crate::network::{FrameTransmitter, SessionState, TransmitterEvent, TransmitterStats, TransportRuntime};
use crate::video::RawFrame;

/// Notifications for the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    StreamingStateChanged(bool),
    StreamingError(String),
    /// Bytes of one frame delivered to the client
    FrameTransmitted(usize),
}

/// Combined pipeline statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub frames_pushed: u64,
    pub frames_transmitted: u64,
    pub encoder: EncoderStats,
    pub transmitter: TransmitterStats,
}

pub struct StreamPipeline {
    config: AppConfig,
    encoder: FrameEncoder,
    transmitter: FrameTransmitter,
    transmitter_events: Receiver<TransmitterEvent>,
    events: EventSink<StreamEvent>,
    streaming: bool,
    frames_pushed: u64,
    frames_transmitted: u64,
}

impl StreamPipeline {
    /// Build and initialize the encoder; transmission starts with
    /// [`start_streaming`](Self::start_streaming)
    pub fn new(config: AppConfig, runtime: Arc<TransportRuntime>) -> Self {
        let events = EventSink::new();

        let mut encoder = FrameEncoder::new(config.encoder_settings());
        let transmitter = FrameTransmitter::new(config.transmitter_settings(), runtime);
        let transmitter_events = transmitter.events();

        if let Err(e) = encoder.initialize() {
            tracing::error!("Failed to initialize encoder: {}", e);
            events.emit(StreamEvent::StreamingError(e.to_string()));
        }

        Self {
            config,
            encoder,
            transmitter,
            transmitter_events,
            events,
            streaming: false,
            frames_pushed: 0,
            frames_transmitted: 0,
        }
    }

    /// Open the transport and begin forwarding encoded frames
    pub fn start_streaming(&mut self) -> Result<()> {
        if self.streaming {
            tracing::warn!("Already streaming");
            return Err(TransportError::AlreadyActive.into());
        }
        if !self.encoder.is_initialized() {
            tracing::error!("Cannot start streaming, encoder not initialized");
            return Err(EncoderError::NotInitialized.into());
        }

        if let Err(e) = self.transmitter.start_transmission() {
            // The transmitter already reported the failure as an event.
            self.pump_events();
            return Err(e.into());
        }

        self.streaming = true;
        self.emit(StreamEvent::StreamingStateChanged(true));
        tracing::info!("Started streaming to {}", self.stream_url());
        Ok(())
    }

    /// Close the transport; safe to call repeatedly
    pub fn stop_streaming(&mut self) {
        self.transmitter.stop_transmission();

        // Deliveries still pending are reported; the transport's own
        // Closed notification is not translated once streaming is off.
        let was_streaming = std::mem::replace(&mut self.streaming, false);
        self.pump_events();

        if was_streaming {
            self.emit(StreamEvent::StreamingStateChanged(false));
            tracing::info!("Stopped streaming");
        }
    }

    /// Submit a captured frame and forward whatever the encoder finished
    pub fn push_frame(&mut self, frame: RawFrame) -> Result<()> {
        self.encoder.submit_frame(frame)?;
        self.frames_pushed += 1;
        self.pump_events();
        Ok(())
    }

    /// Forward finished frames and translate transmitter notifications
    ///
    /// Returns the number of events emitted.
    pub fn pump_events(&mut self) -> usize {
        self.forward_encoded();

        let mut emitted = 0;
        while let Ok(event) = self.transmitter_events.try_recv() {
            let translated = match event {
                TransmitterEvent::Error(message) => Some(StreamEvent::StreamingError(message)),
                TransmitterEvent::FrameTransmitted(frame) => {
                    self.frames_transmitted += 1;
                    Some(StreamEvent::FrameTransmitted(frame.len()))
                }
                TransmitterEvent::StateChanged(SessionState::Closed) if self.streaming => {
                    tracing::warn!("Transport closed, streaming stopped");
                    self.streaming = false;
                    Some(StreamEvent::StreamingStateChanged(false))
                }
                TransmitterEvent::StateChanged(state) => {
                    tracing::debug!("Transport state {:?}", state);
                    None
                }
            };

            if let Some(event) = translated {
                self.emit(event);
                emitted += 1;
            }
        }
        emitted
    }

    /// Switch quality tier; a resolution change restarts the encoder
    pub fn set_stream_quality(&mut self, quality: StreamQuality) -> Result<()> {
        if self.config.stream.quality == quality {
            return Ok(());
        }
        self.config.stream.quality = quality;
        self.encoder.update_settings(self.config.encoder_settings())?;
        tracing::info!("Stream quality changed to {:?}", quality);
        Ok(())
    }

    /// Retune the encoder bitrate without a restart
    ///
    /// The value is clamped to the supported range.
    pub fn set_dynamic_bitrate(&mut self, bitrate_kbps: u32) -> Result<()> {
        let bitrate_kbps = bitrate_kbps.clamp(MIN_BITRATE_KBPS, MAX_BITRATE_KBPS);
        if self.encoder.settings().bitrate_kbps == bitrate_kbps {
            return Ok(());
        }

        self.config.stream.bitrate_kbps = bitrate_kbps;
        // Pin the current resolution so the tier preset does not overwrite the bitrate.
        let mut settings = self.encoder.settings().clone();
        settings.quality = StreamQuality::Custom;
        settings.bitrate_kbps = bitrate_kbps;
        self.encoder.update_settings(settings)?;

        tracing::info!("Bitrate changed to {} Kbps", bitrate_kbps);
        Ok(())
    }

    /// URL a viewer connects to
    pub fn stream_url(&self) -> String {
        let network = &self.config.network;
        let host = match network.bind_address.as_str() {
            "0.0.0.0" | "::" => "localhost",
            other => other,
        };
        let port = self
            .transmitter
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(network.port);
        format!("tcp://{}:{}", host, port)
    }

    /// Time between captures at the encoder's target rate
    pub fn capture_interval(&self) -> Duration {
        self.encoder.settings().frame_interval()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn encoder(&self) -> &FrameEncoder {
        &self.encoder
    }

    pub fn transmitter(&self) -> &FrameTransmitter {
        &self.transmitter
    }

    pub fn events(&self) -> Receiver<StreamEvent> {
        self.events.receiver()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_pushed: self.frames_pushed,
            frames_transmitted: self.frames_transmitted,
            encoder: self.encoder.stats(),
            transmitter: self.transmitter.stats(),
        }
    }

    fn forward_encoded(&mut self) {
        while let Some(encoded) = self.encoder.get_encoded_frame() {
            if !self.streaming {
                tracing::trace!("Not streaming, discarding encoded frame {}", encoded.sequence);
                continue;
            }
            if let Err(e) = self.transmitter.transmit_frame(encoded) {
                tracing::debug!("Encoded frame not queued: {}", e);
            }
        }
    }

    fn emit(&self, event: StreamEvent) {
        match event {
            StreamEvent::FrameTransmitted(_) => {
                self.events.emit_lossy(event);
            }
            _ => self.events.emit(event),
        }
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        self.stop_streaming();
        self.encoder.shutdown();
    }
}
