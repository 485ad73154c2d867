//! Error types and handling
//!
//! The recorder distinguishes four failure families:
//! - `ConfigError`: capability negotiation failed before the session owned anything
//! - `CaptureError`: a frame/audio source or encoder died mid-session
//! - `WriterError`: container I/O failed
//! - `ContractViolation`: a component broke the pipeline protocol

use crate::encoder::StreamKind;
use crate::recorder::state::PipelineState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Capability negotiation failures. Nothing has been started when these occur.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Capture source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Insufficient storage: {available} bytes available, {required} required")]
    InsufficientStorage { available: u64, required: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A capture source or encoder device failed while the session was running.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("{kind} source lost: {reason}")]
    SourceLost { kind: StreamKind, reason: String },

    #[error("{kind} encoder failed: {reason}")]
    Encoder { kind: StreamKind, reason: String },

    #[error("Capture interrupted: {0}")]
    Interrupted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Container output failures.
#[derive(Error, Debug)]
pub enum WriterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Container never started: {registered} of {required} tracks registered")]
    NeverStarted { registered: usize, required: usize },

    #[error("Muxer error: {0}")]
    Muxer(String),
}

/// Protocol breaches between pipeline components. These are programming errors
/// and always fail the session.
#[derive(Error, Debug)]
pub enum ContractViolation {
    #[error("{0} encoder changed its output format twice")]
    FormatChangedTwice(StreamKind),

    #[error("{0} encoder produced a sample before its format")]
    SampleBeforeFormat(StreamKind),

    #[error("Track registration beyond the {required} required tracks")]
    TooManyTracks { required: usize },

    #[error("Unknown track handle {0}")]
    UnknownTrack(usize),

    #[error("Sample written after the container was finalized")]
    WriteAfterFinalize,
}

/// Top-level error for pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error(transparent)]
    Contract(#[from] ContractViolation),

    #[error("Request rejected in state {0:?}")]
    InvalidState(PipelineState),
}

/// Failure category reported through `ResultCallback::on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Config,
    Capture,
    Writer,
    Contract,
    State,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Config => "CONFIG_ERROR",
            ErrorKind::Capture => "CAPTURE_ERROR",
            ErrorKind::Writer => "WRITER_ERROR",
            ErrorKind::Contract => "CONTRACT_VIOLATION",
            ErrorKind::State => "INVALID_STATE",
        }
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Capture(_) => ErrorKind::Capture,
            PipelineError::Writer(_) => ErrorKind::Writer,
            PipelineError::Contract(_) => ErrorKind::Contract,
            PipelineError::InvalidState(_) => ErrorKind::State,
        }
    }
}

/// Error response for external collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&PipelineError> for ErrorResponse {
    fn from(error: &PipelineError) -> Self {
        ErrorResponse {
            code: error.kind().code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;
