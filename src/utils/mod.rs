//! Shared utilities

pub mod error;
pub mod storage;

pub use error::{
    CaptureError, ConfigError, ContractViolation, ErrorKind, ErrorResponse, PipelineError,
    PipelineResult, WriterError,
};
pub use storage::{DiskSpaceProbe, StorageProbe};
