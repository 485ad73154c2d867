//! Capture configuration and recorder settings
//!
//! `VideoConfig`/`AudioConfig` are created once per session from the current
//! display and user preferences and never mutated afterwards.
//! `RecorderSettings` is the persisted preference file.

use crate::capture::traits::DisplayInfo;
use crate::encoder::StreamKind;
use crate::utils::error::ConfigError;
use crate::utils::storage;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Standard resolutions (landscape), all multiples of 8.
const VALID_RESOLUTIONS: &[(u32, u32)] = &[
    // CEA
    (640, 480),
    (720, 480),
    (720, 576),
    (1280, 720),
    (1920, 1080),
    // VESA
    (800, 600),
    (1024, 768),
    (1152, 864),
    (1280, 768),
    (1280, 800),
    (1360, 768),
    (1366, 768),
    (1280, 1024),
    (1600, 1200),
    (1920, 1200),
    // Handheld
    (800, 480),
    (854, 480),
    (864, 480),
    (640, 360),
    (848, 480),
];

const MIB: u32 = 1024 * 1024;

/// Video codec identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Hevc,
    Avc,
    /// Uncompressed frames, always available in software
    Raw,
}

impl VideoCodec {
    pub fn mime(&self) -> &'static str {
        match self {
            VideoCodec::Hevc => "video/hevc",
            VideoCodec::Avc => "video/avc",
            VideoCodec::Raw => "video/raw",
        }
    }
}

/// Audio codec identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    /// 16-bit little-endian PCM
    Pcm,
}

impl AudioCodec {
    pub fn mime(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "audio/mp4a-latm",
            AudioCodec::Pcm => "audio/raw",
        }
    }
}

/// Where session audio comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioSource {
    Microphone,
    /// Playback of the device itself (loopback)
    Internal,
    #[default]
    Disabled,
}

/// Acquisition and encoding parameters for the display stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub density_dpi: u32,
    /// Display rotation in degrees, written as the container orientation hint
    pub rotation: u16,
    pub frame_rate: u32,
    pub bitrate: u32,
    /// Key frame interval in seconds
    #[serde(default = "default_iframe_interval")]
    pub iframe_interval_secs: u32,
    pub codec: VideoCodec,
}

fn default_iframe_interval() -> u32 {
    1
}

impl VideoConfig {
    /// Build a config mirroring `display` with the profile's rate settings
    pub fn for_display(display: &DisplayInfo, profile: DeviceProfile, codec: VideoCodec) -> Self {
        let (bitrate, frame_rate) = match profile {
            DeviceProfile::LowRam => (10 * MIB, 30),
            DeviceProfile::Standard => (20 * MIB, 60),
        };
        Self {
            width: display.width,
            height: display.height,
            density_dpi: display.density_dpi,
            rotation: display.rotation,
            frame_rate,
            bitrate,
            iframe_interval_secs: default_iframe_interval(),
            codec,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidParameter(format!(
                "video size {}x{}",
                self.width, self.height
            )));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(ConfigError::InvalidParameter(format!(
                "video size {}x{} must be even",
                self.width, self.height
            )));
        }
        if self.frame_rate == 0 || self.frame_rate > 240 {
            return Err(ConfigError::InvalidParameter(format!(
                "frame rate {}",
                self.frame_rate
            )));
        }
        if !matches!(self.rotation, 0 | 90 | 180 | 270) {
            return Err(ConfigError::InvalidParameter(format!(
                "rotation {}",
                self.rotation
            )));
        }
        if self.bitrate == 0 {
            return Err(ConfigError::InvalidParameter("video bitrate 0".to_string()));
        }
        Ok(())
    }

    /// Nominal frame duration in microseconds
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.frame_rate.max(1)))
    }
}

/// Acquisition and encoding parameters for the audio stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    pub source: AudioSource,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
    pub codec: AudioCodec,
    /// Input device name; `None` selects the platform default
    #[serde(default)]
    pub device: Option<String>,
}

impl AudioConfig {
    /// Microphone preset: 44.1 kHz mono, 64 kbit/s
    pub fn microphone(codec: AudioCodec) -> Self {
        Self {
            source: AudioSource::Microphone,
            sample_rate: 44_100,
            channels: 1,
            bitrate: 64 * 1024,
            codec,
            device: None,
        }
    }

    /// Internal playback preset: 44.1 kHz stereo, 128 kbit/s
    pub fn internal(codec: AudioCodec) -> Self {
        Self {
            source: AudioSource::Internal,
            sample_rate: 44_100,
            channels: 2,
            bitrate: 128_000,
            codec,
            device: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            source: AudioSource::Disabled,
            sample_rate: 44_100,
            channels: 2,
            bitrate: 128_000,
            codec: AudioCodec::Aac,
            device: None,
        }
    }

    /// Preset for `source`
    pub fn for_source(source: AudioSource, codec: AudioCodec) -> Self {
        match source {
            AudioSource::Microphone => Self::microphone(codec),
            AudioSource::Internal => Self::internal(codec),
            AudioSource::Disabled => Self::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.source != AudioSource::Disabled
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.is_enabled() {
            return Ok(());
        }
        if !(8_000..=192_000).contains(&self.sample_rate) {
            return Err(ConfigError::InvalidParameter(format!(
                "sample rate {}",
                self.sample_rate
            )));
        }
        if self.channels == 0 || self.channels > 2 {
            return Err(ConfigError::InvalidParameter(format!(
                "channel count {}",
                self.channels
            )));
        }
        Ok(())
    }

    /// Bytes per interleaved 16-bit PCM frame
    pub fn bytes_per_frame(&self) -> usize {
        usize::from(self.channels) * 2
    }
}

/// Immutable description of one stream's acquisition parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum CaptureConfig {
    Video(VideoConfig),
    Audio(AudioConfig),
}

impl CaptureConfig {
    pub fn kind(&self) -> StreamKind {
        match self {
            CaptureConfig::Video(_) => StreamKind::Video,
            CaptureConfig::Audio(_) => StreamKind::Audio,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            CaptureConfig::Video(video) => video.validate(),
            CaptureConfig::Audio(audio) => audio.validate(),
        }
    }
}

/// Rate profile chosen from device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceProfile {
    LowRam,
    #[default]
    Standard,
}

/// Encoder limits for one video codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoCaps {
    pub max_width: u32,
    pub max_height: u32,
    pub max_bitrate: u32,
}

/// Fit a display size to encoder limits.
///
/// Sizes within limits are returned unchanged. Otherwise the largest standard
/// resolution with exactly the same aspect ratio is chosen, keeping the
/// display orientation; 640x480 (or 480x640) when none matches.
pub fn fit_resolution(
    width: u32,
    height: u32,
    caps: &VideoCaps,
    max_dimension: Option<u32>,
) -> (u32, u32) {
    let max = caps.max_width.max(caps.max_height);
    let mut min = caps.max_width.min(caps.max_height);

    let landscape = width > height;
    let (long, short) = if landscape {
        (width, height)
    } else {
        (height, width)
    };

    if let Some(constraint) = max_dimension {
        if short > constraint {
            min = min.min(constraint);
        }
    }

    if long <= max && short <= min {
        return (width, height);
    }

    let best = VALID_RESOLUTIONS
        .iter()
        .filter(|(w, h)| *w <= max && *h <= min)
        .filter(|(w, h)| u64::from(*w) * u64::from(short) == u64::from(*h) * u64::from(long))
        .max_by_key(|(w, h)| u64::from(*w) * u64::from(*h));

    match (best, landscape) {
        (Some(&(w, h)), true) => (w, h),
        (Some(&(w, h)), false) => (h, w),
        (None, true) => (640, 480),
        (None, false) => (480, 640),
    }
}

/// Persisted recorder preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderSettings {
    /// Directory recordings are written to; platform videos dir when unset
    pub output_dir: Option<PathBuf>,
    /// Refuse to start, and stop recording, below this many free bytes
    pub min_free_bytes: u64,
    /// How often free space is re-checked while recording
    pub storage_check_interval_secs: u64,
    /// Encoder loop polling timeout
    pub poll_timeout_ms: u64,
    /// Upper bound on waiting for an encoder's end-of-stream after a drain request
    pub drain_timeout_ms: u64,
    pub audio_source: AudioSource,
    pub profile: DeviceProfile,
    /// Cap on the short side of the recorded video
    pub max_dimension: Option<u32>,
    /// Video codecs in order of preference
    pub video_codecs: Vec<VideoCodec>,
    /// Audio codecs in order of preference
    pub audio_codecs: Vec<AudioCodec>,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            output_dir: None,
            min_free_bytes: 100 * 1024 * 1024,
            storage_check_interval_secs: 5,
            poll_timeout_ms: 10,
            drain_timeout_ms: 2_000,
            audio_source: AudioSource::Disabled,
            profile: DeviceProfile::Standard,
            max_dimension: None,
            video_codecs: vec![VideoCodec::Hevc, VideoCodec::Avc, VideoCodec::Raw],
            audio_codecs: vec![AudioCodec::Aac, AudioCodec::Pcm],
        }
    }
}

impl RecorderSettings {
    /// Load settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No settings at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let settings: RecorderSettings = serde_json::from_str(&content)
            .map_err(|e| ConfigError::InvalidParameter(format!("settings {:?}: {}", path, e)))?;

        tracing::debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Write settings as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::InvalidParameter(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(storage::default_output_dir)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn storage_check_interval(&self) -> Duration {
        Duration::from_secs(self.storage_check_interval_secs.max(1))
    }
}
