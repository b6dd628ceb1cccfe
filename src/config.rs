//! Streaming configuration
//!
//! Settings snapshots handed to the encoder and transmitter, the quality
//! tier presets, and the on-disk TOML configuration file.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result, TransportError};

/// Named stream quality presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamQuality {
    /// 854x480 at 15 fps
    #[serde(rename = "Preview_480p")]
    Preview480p,
    /// 1280x720 at 30 fps
    #[serde(rename = "HD_720p")]
    Hd720p,
    /// 1920x1080 at 30 fps
    #[serde(rename = "HD_1080p")]
    Hd1080p,
    /// 1920x1080 at 60 fps
    #[serde(rename = "HD_1080p60")]
    Hd1080p60,
    /// 3840x2160 at 30 fps
    #[serde(rename = "UHD_4K")]
    Uhd4k,
    /// Caller-provided values are used as-is
    Custom,
}

/// Values a quality tier forces onto [`EncoderSettings`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityPreset {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub jpeg_quality: u8,
    pub keyframe_interval: u32,
    pub preset: &'static str,
}

impl StreamQuality {
    /// Preset for this tier, `None` for [`StreamQuality::Custom`]
    pub fn preset(self) -> Option<QualityPreset> {
        let preset = match self {
            StreamQuality::Preview480p => QualityPreset {
                width: 854,
                height: 480,
                fps: 15,
                bitrate_kbps: 1500,
                jpeg_quality: 60,
                keyframe_interval: 30,
                preset: "ultrafast",
            },
            StreamQuality::Hd720p => QualityPreset {
                width: 1280,
                height: 720,
                fps: 30,
                bitrate_kbps: 4000,
                jpeg_quality: 75,
                keyframe_interval: 60,
                preset: "veryfast",
            },
            StreamQuality::Hd1080p => QualityPreset {
                width: 1920,
                height: 1080,
                fps: 30,
                bitrate_kbps: 8000,
                jpeg_quality: 85,
                keyframe_interval: 60,
                preset: "veryfast",
            },
            StreamQuality::Hd1080p60 => QualityPreset {
                width: 1920,
                height: 1080,
                fps: 60,
                bitrate_kbps: 12000,
                jpeg_quality: 85,
                keyframe_interval: 120,
                preset: "superfast",
            },
            StreamQuality::Uhd4k => QualityPreset {
                width: 3840,
                height: 2160,
                fps: 30,
                bitrate_kbps: 25000,
                jpeg_quality: 90,
                keyframe_interval: 60,
                preset: "fast",
            },
            StreamQuality::Custom => return None,
        };
        Some(preset)
    }
}

/// Encoder implementation preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncoderType {
    Auto,
    Nvenc,
    Amf,
    QuickSync,
    Software,
}

impl EncoderType {
    pub fn is_hardware(self) -> bool {
        matches!(self, EncoderType::Nvenc | EncoderType::Amf | EncoderType::QuickSync)
    }
}

/// Bitstream produced by the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecFormat {
    /// One JPEG image per frame
    Mjpeg,
    /// Not implemented; selecting it falls back to [`CodecFormat::Mjpeg`]
    H264,
}

/// Encoder configuration snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    /// Target bitrate in Kbps
    pub bitrate_kbps: u32,
    pub quality: StreamQuality,
    pub codec_format: CodecFormat,
    pub encoder_type: EncoderType,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    pub keyframe_interval: u32,
    pub preset: String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            target_fps: 30,
            bitrate_kbps: 8000,
            quality: StreamQuality::Custom,
            codec_format: CodecFormat::Mjpeg,
            encoder_type: EncoderType::Auto,
            jpeg_quality: 85,
            keyframe_interval: 60,
            preset: "veryfast".to_string(),
        }
    }
}

impl EncoderSettings {
    /// Settings for a quality tier with its preset already applied
    pub fn for_quality(quality: StreamQuality) -> Self {
        let mut settings = Self {
            quality,
            ..Self::default()
        };
        settings.apply_quality_preset();
        settings
    }

    /// Overwrite resolution, rate and quality fields from the tier preset
    pub fn apply_quality_preset(&mut self) {
        if let Some(preset) = self.quality.preset() {
            self.width = preset.width;
            self.height = preset.height;
            self.target_fps = preset.fps;
            self.bitrate_kbps = preset.bitrate_kbps;
            self.jpeg_quality = preset.jpeg_quality;
            self.keyframe_interval = preset.keyframe_interval;
            self.preset = preset.preset.to_string();
        }
        self.jpeg_quality = self.jpeg_quality.clamp(1, 100);
    }

    /// Whether moving from `self` to `other` needs a full encoder restart
    pub fn requires_restart(&self, other: &EncoderSettings) -> bool {
        self.width != other.width
            || self.height != other.height
            || self.codec_format != other.codec_format
    }

    /// Time between frames at the target rate
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps.max(MIN_FPS) as f64)
    }
}

/// Transmitter configuration snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmitterSettings {
    pub bind_address: String,
    pub port: u16,
    /// Latency tolerance in milliseconds (0 = no write timeout)
    pub latency_ms: u32,
    /// Hard bandwidth cap in bytes per second (0 = unlimited)
    pub max_bw: u64,
    /// Expected input rate in bytes per second (0 = unlimited)
    pub input_bw: u64,
    /// Headroom over `input_bw` in percent
    pub overhead_percent: u32,
    /// Consecutive failed accept attempts before the session closes
    pub reconnect_attempts: u32,
    /// Pause between accept attempts in milliseconds
    pub accept_interval_ms: u64,
    /// Pending outbound frames before the oldest is dropped
    pub outbound_capacity: usize,
}

impl Default for TransmitterSettings {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            latency_ms: DEFAULT_LATENCY_MS,
            max_bw: 0,
            input_bw: 0,
            overhead_percent: DEFAULT_OVERHEAD_PERCENT,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            accept_interval_ms: DEFAULT_ACCEPT_INTERVAL_MS,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl TransmitterSettings {
    /// Address the listening socket binds to
    pub fn socket_addr(&self) -> std::result::Result<SocketAddr, TransportError> {
        let ip: IpAddr = self.bind_address.parse().map_err(|_| {
            TransportError::Bind(format!("invalid bind address: {}", self.bind_address))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Effective send rate cap in bytes per second, `None` when unlimited
    pub fn bandwidth_cap(&self) -> Option<u64> {
        if self.max_bw > 0 {
            Some(self.max_bw)
        } else if self.input_bw > 0 {
            Some(self.input_bw * (100 + self.overhead_percent as u64) / 100)
        } else {
            None
        }
    }

    /// Client write timeout, `None` when disabled
    pub fn write_timeout(&self) -> Option<Duration> {
        (self.latency_ms > 0).then(|| Duration::from_millis(self.latency_ms as u64))
    }

    pub fn accept_interval(&self) -> Duration {
        Duration::from_millis(self.accept_interval_ms)
    }
}

/// `[stream]` section of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub auto_start: bool,
    pub quality: StreamQuality,
    /// Resolution used when `quality` is `Custom`
    pub custom_width: u32,
    pub custom_height: u32,
    pub target_fps: u32,
    pub bitrate_kbps: u32,
    pub encoder_type: EncoderType,
    pub codec_format: CodecFormat,
    pub jpeg_quality: u8,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            auto_start: true,
            quality: StreamQuality::Hd1080p,
            custom_width: 1920,
            custom_height: 1080,
            target_fps: 30,
            bitrate_kbps: 8000,
            encoder_type: EncoderType::Auto,
            codec_format: CodecFormat::Mjpeg,
            jpeg_quality: 85,
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub network: TransmitterSettings,
}

impl AppConfig {
    /// Default config file location for this platform
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "frame-streamer")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Write the config as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let stream = &self.stream;
        if !(MIN_FPS..=MAX_FPS).contains(&stream.target_fps) {
            return Err(Error::Config(format!(
                "target_fps {} outside {}..={}",
                stream.target_fps, MIN_FPS, MAX_FPS
            )));
        }
        if !(MIN_BITRATE_KBPS..=MAX_BITRATE_KBPS).contains(&stream.bitrate_kbps) {
            return Err(Error::Config(format!(
                "bitrate_kbps {} outside {}..={}",
                stream.bitrate_kbps, MIN_BITRATE_KBPS, MAX_BITRATE_KBPS
            )));
        }
        if stream.custom_width == 0 || stream.custom_height == 0 {
            return Err(Error::Config("custom resolution must be non-zero".into()));
        }
        if stream.custom_width > MAX_FRAME_DIMENSION || stream.custom_height > MAX_FRAME_DIMENSION {
            return Err(Error::Config(format!(
                "custom resolution {}x{} exceeds {} per side",
                stream.custom_width, stream.custom_height, MAX_FRAME_DIMENSION
            )));
        }
        if self.network.reconnect_attempts == 0 {
            return Err(Error::Config("reconnect_attempts must be at least 1".into()));
        }
        if self.network.outbound_capacity == 0 {
            return Err(Error::Config("outbound_capacity must be at least 1".into()));
        }
        self.network
            .socket_addr()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(())
    }

    /// Encoder settings described by the `[stream]` section
    pub fn encoder_settings(&self) -> EncoderSettings {
        let stream = &self.stream;
        let mut settings = EncoderSettings {
            width: stream.custom_width,
            height: stream.custom_height,
            target_fps: stream.target_fps,
            bitrate_kbps: stream.bitrate_kbps,
            quality: stream.quality,
            codec_format: stream.codec_format,
            encoder_type: stream.encoder_type,
            jpeg_quality: stream.jpeg_quality,
            ..EncoderSettings::default()
        };
        settings.apply_quality_preset();
        settings
    }

    pub fn transmitter_settings(&self) -> TransmitterSettings {
        self.network.clone()
    }
}
