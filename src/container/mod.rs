//! Container output
//!
//! The shared writer both encoders feed, and the MP4 muxer behind it.

pub mod mp4;
pub mod muxer;
pub mod writer;

pub use mp4::{Mp4Muxer, Mp4MuxerFactory};
pub use muxer::{Muxer, MuxerFactory};
pub use writer::{ContainerSummary, ContainerWriter, FinalizeOutcome, TrackSummary, WriteOutcome};
