//! Frame Streamer Application
//!
//! Generates a moving test pattern and streams it as motion-JPEG to one
//! TCP viewer.
//!
//! Usage: `streamer [config.toml]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use frame_streamer::{
    config::AppConfig,
    network::TransportRuntime,
    pipeline::{StreamEvent, StreamPipeline},
    video::{PixelFormat, RawFrame},
};

/// Seconds between stats lines
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Diagonal BGRA gradient scrolled by `tick`, with a white bar sweeping across
fn test_pattern(width: u32, height: u32, tick: u64) -> RawFrame {
    let mut data = Vec::with_capacity(width as usize * height as usize * 4);
    let bar = (tick * 8 % width.max(1) as u64) as u32;

    for y in 0..height {
        for x in 0..width {
            if x.abs_diff(bar) < 8 {
                data.extend_from_slice(&[255, 255, 255, 255]);
                continue;
            }
            let shift = (x as u64 + y as u64 + tick) as u8;
            data.extend_from_slice(&[shift, (y % 256) as u8, (x % 256) as u8, 255]);
        }
    }

    RawFrame::new(data, width, height, PixelFormat::Bgra8)
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Frame Streamer");

    // Config path from args, else the platform default
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(AppConfig::default_path)
        .context("no config path given and no platform config directory")?;

    let config = AppConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let auto_start = config.stream.auto_start;

    let mut pipeline = StreamPipeline::new(config, TransportRuntime::process());
    let events = pipeline.events();

    let (width, height) = {
        let settings = pipeline.encoder().settings();
        (settings.width, settings.height)
    };
    tracing::info!(
        "Test pattern {}x{} every {:?}",
        width,
        height,
        pipeline.capture_interval()
    );

    if !auto_start {
        tracing::info!("auto_start is off in {}, nothing to do", config_path.display());
        return Ok(());
    }

    pipeline.start_streaming()?;
    println!("\nViewer URL: {}\n", pipeline.stream_url());

    let mut tick: u64 = 0;
    let mut last_stats = Instant::now();

    tracing::info!("Starting main loop - press Ctrl+C to stop");

    loop {
        let started = Instant::now();

        if let Err(e) = pipeline.push_frame(test_pattern(width, height, tick)) {
            tracing::warn!("Failed to push frame: {}", e);
        }
        tick += 1;

        for event in events.try_iter() {
            match event {
                StreamEvent::StreamingStateChanged(false) => {
                    tracing::warn!("Streaming stopped, restarting transmission");
                    if let Err(e) = pipeline.start_streaming() {
                        tracing::error!("Restart failed: {}", e);
                    }
                }
                StreamEvent::StreamingError(message) => tracing::warn!("Stream error: {}", message),
                StreamEvent::StreamingStateChanged(true) | StreamEvent::FrameTransmitted(_) => {}
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            let stats = pipeline.stats();
            tracing::info!(
                "Stats: {} pushed, {} encoded ({} dropped), {} sent, {:.1} KB sent, avg encode {:.1}ms",
                stats.frames_pushed,
                stats.encoder.frames_encoded,
                stats.encoder.frames_dropped,
                stats.transmitter.frames_sent,
                stats.transmitter.bytes_sent as f64 / 1024.0,
                stats.encoder.average_encode_time_secs * 1000.0
            );
            last_stats = Instant::now();
        }

        // Hold the target frame rate
        if let Some(rest) = pipeline.capture_interval().checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }
}
