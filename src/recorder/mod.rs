//! Recording pipeline
//!
//! - `PipelineController` owns sessions and the state machine
//! - `TrackSink` forwards encoder output into the shared container
//! - `ResultCallback` / `RecordingEvent` report results to collaborators

pub mod callback;
pub mod config;
pub mod controller;
pub mod sink;
pub mod state;

pub use callback::{LoggingCallback, RecordingEvent, ResultCallback};
pub use config::{
    AudioCodec, AudioConfig, AudioSource, CaptureConfig, DeviceProfile, RecorderSettings,
    VideoCaps, VideoCodec, VideoConfig,
};
pub use controller::{Capabilities, PipelineController};
pub use sink::{SupervisorEvent, TrackSink};
pub use state::{PipelineState, RecordingOutput, RecordingSegment, SessionHandle};
