//! Muxer trait definition
//!
//! A muxer interleaves encoded samples of several tracks into one container
//! file. Lifecycle: `add_track` for every track, `start` once, any number of
//! `write_sample`, then `finish` (or `abort`).

use crate::encoder::{EncodedSample, TrackFormat};
use crate::utils::error::WriterError;
use std::path::Path;

pub trait Muxer: Send {
    fn name(&self) -> &str;

    /// Declare a track; returns its index in the container
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize, WriterError>;

    /// Write the container header. No tracks may be added afterwards.
    fn start(&mut self) -> Result<(), WriterError>;

    fn write_sample(&mut self, track: usize, sample: &EncodedSample) -> Result<(), WriterError>;

    /// Write the index and close the container
    fn finish(&mut self) -> Result<(), WriterError>;

    /// Stop writing without producing a playable file
    fn abort(&mut self) {}
}

/// Opens the muxer a session writes its output file with
pub trait MuxerFactory: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn Muxer>, WriterError>;
}
