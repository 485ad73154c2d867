//! Recording state management
//!
//! Defines the pipeline state machine and pause/resume segment tracking.

use crate::container::ContainerSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Current state of the capture pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// No session
    #[default]
    Idle,
    /// Session allocated, waiting for the first sample of every stream
    Starting,
    Running,
    Pausing,
    Paused,
    /// Draining encoders and finalizing the container
    Stopping,
    /// Last session finished with a playable file
    Stopped,
    /// Last session failed; its output was deleted
    Failed,
}

impl PipelineState {
    /// States in which a new session may be started
    pub fn is_quiescent(&self) -> bool {
        matches!(
            self,
            PipelineState::Idle | PipelineState::Stopped | PipelineState::Failed
        )
    }

    /// States owning a live session
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PipelineState::Starting
                | PipelineState::Running
                | PipelineState::Pausing
                | PipelineState::Paused
        )
    }
}

/// One uninterrupted stretch of recording.
///
/// A new segment starts each time recording is resumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSegment {
    /// Segment index (0, 1, 2, ...)
    pub index: usize,

    /// Duration of this segment in milliseconds
    pub duration_ms: f64,

    /// Process time when the segment started (relative to session start)
    pub process_time_start_ms: f64,

    /// Process time when the segment ended
    pub process_time_end_ms: f64,

    /// Wall clock when the segment started
    pub started_at: DateTime<Utc>,

    /// Wall clock when the segment ended
    pub ended_at: Option<DateTime<Utc>>,
}

impl RecordingSegment {
    /// Create a new segment starting now
    pub fn new(index: usize, process_time_ms: f64) -> Self {
        Self {
            index,
            duration_ms: 0.0,
            process_time_start_ms: process_time_ms,
            process_time_end_ms: process_time_ms,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// End the segment
    pub fn end(&mut self, process_time_ms: f64) {
        if self.ended_at.is_some() {
            return;
        }
        self.process_time_end_ms = process_time_ms;
        self.duration_ms = self.process_time_end_ms - self.process_time_start_ms;
        self.ended_at = Some(Utc::now());
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Duration so far, counting an open segment up to `process_time_ms`
    pub fn elapsed_ms(&self, process_time_ms: f64) -> f64 {
        if self.is_open() {
            (process_time_ms - self.process_time_start_ms).max(0.0)
        } else {
            self.duration_ms
        }
    }
}

/// Total recorded time across segments
pub fn recorded_ms(segments: &[RecordingSegment], process_time_ms: f64) -> f64 {
    segments.iter().map(|s| s.elapsed_ms(process_time_ms)).sum()
}

/// Handle returned by a successful `start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    pub id: Uuid,
    /// File the session records into
    pub output_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub video_enabled: bool,
    pub audio_enabled: bool,
}

/// Result of a completed recording
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOutput {
    pub session_id: Uuid,

    /// Path to the finalized file
    pub output_path: PathBuf,

    /// Recorded duration in milliseconds, pauses excluded
    pub total_duration_ms: f64,

    pub segments: Vec<RecordingSegment>,

    pub container: ContainerSummary,
}
