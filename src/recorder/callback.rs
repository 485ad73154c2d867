//! Result delivery to external collaborators

use super::state::PipelineState;
use crate::utils::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Session results. Each session yields exactly one `on_stopped` or one
/// `on_error`.
pub trait ResultCallback: Send + Sync {
    /// Every stream delivered its first sample
    fn on_started(&self);

    /// Recorded video time, at most once per second
    fn on_progress(&self, elapsed_us: u64);

    /// The file at `output_path` is flushed and closed
    fn on_stopped(&self, output_path: &Path);

    fn on_error(&self, kind: ErrorKind, message: &str);
}

/// Callback that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCallback;

impl ResultCallback for LoggingCallback {
    fn on_started(&self) {
        tracing::info!("Recording started");
    }

    fn on_progress(&self, elapsed_us: u64) {
        tracing::debug!("Recorded {:.1}s", elapsed_us as f64 / 1_000_000.0);
    }

    fn on_stopped(&self, output_path: &Path) {
        tracing::info!("Recording saved to {:?}", output_path);
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        tracing::error!("Recording failed [{}]: {}", kind.code(), message);
    }
}

/// Events broadcast to subscribers during recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum RecordingEvent {
    StateChanged { state: PipelineState },
    Started,
    Paused,
    Resumed,
    /// Recorded time in microseconds
    #[serde(rename_all = "camelCase")]
    Progress { elapsed_us: u64 },
    /// Free space dropped below the floor; the session is being stopped
    StorageLow { available: u64, required: u64 },
    #[serde(rename_all = "camelCase")]
    Stopped { output_path: PathBuf },
    Error { kind: ErrorKind, message: String },
}
