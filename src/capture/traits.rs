//! Capture trait definitions
//!
//! Platform-agnostic contracts for the two capture capabilities the recorder
//! consumes: display mirroring and raw audio capture.

use crate::capture::clock::SessionClock;
use crate::encoder::{RawChunk, StreamKind};
use crate::recorder::config::{AudioConfig, VideoConfig};
use crate::utils::error::{CaptureError, ConfigError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Information about a display/screen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayInfo {
    /// Unique display ID
    pub id: u32,

    /// Display name
    pub name: String,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Scale factor (e.g., 2.0 for Retina)
    pub scale_factor: f64,

    /// Pixel density
    pub density_dpi: u32,

    /// Current rotation in degrees
    pub rotation: u16,

    /// Whether this is the primary display
    pub is_primary: bool,

    /// Refresh rate in Hz (if available)
    pub refresh_rate: Option<u32>,
}

/// Information about an audio device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDeviceInfo {
    /// Unique device ID
    pub id: String,

    /// Device name
    pub name: String,

    /// Whether this is an input device
    pub is_input: bool,

    /// Whether this is the default device
    pub is_default: bool,
}

/// What a backend does with its platform resource while the session is paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PauseStrategy {
    /// Keep the resource open; the encoder simply stops pulling from it
    #[default]
    IdleInPlace,
    /// Release the resource on pause and reacquire it on resume
    ReleaseAndReacquire,
}

/// A producer of raw frames or PCM chunks, exclusively owned by one encoder.
pub trait CaptureSource: Send {
    fn kind(&self) -> StreamKind;

    /// Wait up to `timeout` for the next chunk. `Ok(None)` means nothing arrived.
    fn read(&mut self, timeout: Duration) -> Result<Option<RawChunk>, CaptureError>;

    /// Release the underlying platform resource (used with `ReleaseAndReacquire`)
    fn suspend(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Reacquire what `suspend` released
    fn resume(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Release everything. Called exactly once by the owning encoder.
    fn release(&mut self);
}

/// Display mirroring capability
#[async_trait]
pub trait DisplayCapture: Send + Sync {
    fn name(&self) -> &str;

    fn pause_strategy(&self) -> PauseStrategy {
        PauseStrategy::IdleInPlace
    }

    /// The display a new session mirrors by default
    async fn default_display(&self) -> Result<DisplayInfo, ConfigError>;

    /// Mirror the display at the configured size and density. Frames are
    /// stamped with `clock`.
    async fn mirror(
        &self,
        config: &VideoConfig,
        clock: SessionClock,
    ) -> Result<Box<dyn CaptureSource>, ConfigError>;

    /// Release the platform capture-session token. Called once per session,
    /// after both encoders have stopped.
    fn release(&self) {}
}

/// Raw audio capture capability
#[async_trait]
pub trait AudioCapture: Send + Sync {
    fn name(&self) -> &str;

    fn pause_strategy(&self) -> PauseStrategy {
        PauseStrategy::IdleInPlace
    }

    /// Open a PCM source (16-bit little-endian, interleaved). Fails with
    /// `ConfigError::SourceUnavailable` when capture is not authorized.
    async fn open(
        &self,
        config: &AudioConfig,
        clock: SessionClock,
    ) -> Result<Box<dyn CaptureSource>, ConfigError>;
}
