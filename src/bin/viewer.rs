//! Frame Viewer Application
//!
//! Connects to a streamer, splits the byte stream back into JPEG frames
//! and reports the received frame rate. Optionally writes the latest frame
//! to disk.
//!
//! Usage: `viewer [host:port] [latest.jpg]`

use anyhow::{Context, Result};
use std::io::Read;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use frame_streamer::constants::DEFAULT_PORT;

const READ_CHUNK: usize = 64 * 1024;
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Splits a motion-JPEG byte stream on start/end-of-image markers
#[derive(Default)]
struct JpegSplitter {
    buffer: Vec<u8>,
}

impl JpegSplitter {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete image, skipping garbage before it
    fn next_frame(&mut self) -> Option<Vec<u8>> {
        let Some(start) = find(&self.buffer, &[0xFF, 0xD8], 0) else {
            // Only a trailing 0xFF can still begin a marker.
            let keep = usize::from(self.buffer.last() == Some(&0xFF));
            let len = self.buffer.len();
            self.buffer.drain(..len - keep);
            return None;
        };
        if start > 0 {
            self.buffer.drain(..start);
        }
        let end = find(&self.buffer, &[0xFF, 0xD9], 2)? + 2;
        Some(self.buffer.drain(..end).collect())
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_PORT));
    let addr = addr.trim_start_matches("tcp://").to_string();
    let snapshot = std::env::args().nth(2).map(PathBuf::from);

    tracing::info!("Connecting to {}", addr);
    let mut stream =
        TcpStream::connect(&addr).with_context(|| format!("connecting to {}", addr))?;
    tracing::info!("Connected, waiting for frames");

    let mut splitter = JpegSplitter::default();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut frames_in_window = 0u32;
    let mut bytes_in_window = 0usize;
    let mut total_frames = 0u64;
    let mut window_start = Instant::now();

    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            tracing::info!("Streamer closed the connection after {} frames", total_frames);
            return Ok(());
        }
        splitter.push(&chunk[..n]);

        while let Some(frame) = splitter.next_frame() {
            frames_in_window += 1;
            bytes_in_window += frame.len();
            total_frames += 1;

            if let Some(path) = &snapshot {
                if let Err(e) = std::fs::write(path, &frame) {
                    tracing::warn!("Failed to write {}: {}", path.display(), e);
                }
            }
        }

        let elapsed = window_start.elapsed();
        if elapsed >= REPORT_INTERVAL {
            let secs = elapsed.as_secs_f64();
            tracing::info!(
                "{:.1} fps, {:.1} KB/s, {} frames total",
                frames_in_window as f64 / secs,
                bytes_in_window as f64 / 1024.0 / secs,
                total_frames
            );
            frames_in_window = 0;
            bytes_in_window = 0;
            window_start = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_without_start_marker_is_discarded() {
        let mut splitter = JpegSplitter::default();
        for _ in 0..100 {
            splitter.push(&[0x00; 1024]);
            assert!(splitter.next_frame().is_none());
        }
        assert!(splitter.buffer.is_empty());
    }

    #[test]
    fn test_start_marker_split_across_reads() {
        let mut splitter = JpegSplitter::default();
        splitter.push(&[0x00, 0x01, 0xFF]);
        assert!(splitter.next_frame().is_none());
        assert_eq!(splitter.buffer, vec![0xFF]);

        splitter.push(&[0xD8, 0x42, 0xFF, 0xD9, 0x00]);
        assert_eq!(splitter.next_frame(), Some(vec![0xFF, 0xD8, 0x42, 0xFF, 0xD9]));
        assert!(splitter.next_frame().is_none());
    }
}
