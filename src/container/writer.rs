//! Container writer
//!
//! Shared by both encoder threads. The container is opened for samples only
//! once every required track has registered its format, and is finalized or
//! discarded exactly once.

use super::mp4::Mp4MuxerFactory;
use super::muxer::{Muxer, MuxerFactory};
use crate::encoder::{EncodedSample, StreamKind, TrackFormat, TrackHandle};
use crate::utils::error::{ContractViolation, PipelineError, WriterError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for track registrations
    Pending,
    Started,
    Finalized,
}

struct Lifecycle {
    phase: Phase,
    registered: Vec<StreamKind>,
    outcome: Option<FinalizeOutcome>,
}

/// What happened to a sample handed to the writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The container had not started yet
    Dropped,
}

/// Per-track statistics of a completed container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub kind: Option<StreamKind>,
    pub samples: u64,
    pub bytes: u64,
    pub first_pts_us: Option<u64>,
    pub last_pts_us: u64,
}

/// A finished, playable container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub path: PathBuf,
    pub tracks: Vec<TrackSummary>,
    /// Samples that arrived before the container started
    pub dropped_samples: u64,
    pub file_size: u64,
}

impl ContainerSummary {
    /// Span between the earliest and latest sample across tracks
    pub fn duration_us(&self) -> u64 {
        let first = self.tracks.iter().filter_map(|t| t.first_pts_us).min();
        let last = self.tracks.iter().map(|t| t.last_pts_us).max();
        match (first, last) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => 0,
        }
    }
}

/// Result of `finalize`/`discard`, cached after the first call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Completed(ContainerSummary),
    /// Not every required track registered; the file was deleted
    NeverStarted { registered: usize, required: usize },
    /// Aborted; the file was deleted
    Discarded,
}

pub struct ContainerWriter {
    path: PathBuf,
    required_tracks: usize,
    lifecycle: RwLock<Lifecycle>,
    muxer: Mutex<Option<Box<dyn Muxer>>>,
    tracks: Vec<Mutex<TrackSummary>>,
    dropped: AtomicU64,
}

impl ContainerWriter {
    /// Create an MP4 file at `path` expecting `required_tracks` streams
    pub fn create(path: &Path, required_tracks: usize) -> Result<Self, WriterError> {
        Self::open(&Mp4MuxerFactory, path, required_tracks)
    }

    /// Open the output through `factory`
    pub fn open(
        factory: &dyn MuxerFactory,
        path: &Path,
        required_tracks: usize,
    ) -> Result<Self, WriterError> {
        if required_tracks == 0 {
            return Err(WriterError::Muxer("a container needs at least one track".to_string()));
        }
        let muxer = factory.open(path)?;
        Self::with_muxer(path, required_tracks, muxer)
    }

    pub fn with_muxer(
        path: &Path,
        required_tracks: usize,
        muxer: Box<dyn Muxer>,
    ) -> Result<Self, WriterError> {
        if required_tracks == 0 {
            return Err(WriterError::Muxer("a container needs at least one track".to_string()));
        }
        tracing::debug!(
            "Container {:?} ({}) waiting for {} tracks",
            path,
            muxer.name(),
            required_tracks
        );
        Ok(Self {
            path: path.to_path_buf(),
            required_tracks,
            lifecycle: RwLock::new(Lifecycle {
                phase: Phase::Pending,
                registered: Vec::with_capacity(required_tracks),
                outcome: None,
            }),
            muxer: Mutex::new(Some(muxer)),
            tracks: (0..required_tracks)
                .map(|_| Mutex::new(TrackSummary::default()))
                .collect(),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn required_tracks(&self) -> usize {
        self.required_tracks
    }

    pub fn is_started(&self) -> bool {
        self.lifecycle.read().phase == Phase::Started
    }

    /// Register a stream's format. The registration completing the required
    /// set starts the container.
    pub fn register_track(&self, format: &TrackFormat) -> Result<TrackHandle, PipelineError> {
        let mut lifecycle = self.lifecycle.write();
        match lifecycle.phase {
            Phase::Finalized => return Err(ContractViolation::WriteAfterFinalize.into()),
            Phase::Started => {
                return Err(ContractViolation::TooManyTracks {
                    required: self.required_tracks,
                }
                .into())
            }
            Phase::Pending => {}
        }

        let mut guard = self.muxer.lock();
        let muxer = guard
            .as_mut()
            .ok_or_else(|| WriterError::Muxer("muxer closed".to_string()))?;

        let index = muxer.add_track(format)?;
        let stats = self
            .tracks
            .get(index)
            .ok_or(ContractViolation::UnknownTrack(index))?;
        stats.lock().kind = Some(format.kind());
        lifecycle.registered.push(format.kind());
        tracing::info!(
            "Registered {} track {} ({}) [{}/{}]",
            format.kind(),
            index,
            format.mime,
            lifecycle.registered.len(),
            self.required_tracks
        );

        if lifecycle.registered.len() == self.required_tracks {
            muxer.start()?;
            lifecycle.phase = Phase::Started;
            tracing::info!("Container started: {:?}", self.path);
        }
        Ok(TrackHandle(index))
    }

    /// Write one sample. Samples arriving before the container started are
    /// dropped without error.
    pub fn write_sample(
        &self,
        track: TrackHandle,
        sample: &EncodedSample,
    ) -> Result<WriteOutcome, PipelineError> {
        let lifecycle = self.lifecycle.read();
        if track.index() >= lifecycle.registered.len() {
            return Err(ContractViolation::UnknownTrack(track.index()).into());
        }
        match lifecycle.phase {
            Phase::Pending => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Dropped sample on {} before start", track);
                return Ok(WriteOutcome::Dropped);
            }
            Phase::Finalized => return Err(ContractViolation::WriteAfterFinalize.into()),
            Phase::Started => {}
        }

        {
            let mut guard = self.muxer.lock();
            let muxer = guard
                .as_mut()
                .ok_or_else(|| WriterError::Muxer("muxer closed".to_string()))?;
            muxer.write_sample(track.index(), sample)?;
        }

        let mut stats = self.tracks[track.index()].lock();
        stats.samples += 1;
        stats.bytes += sample.data.len() as u64;
        stats.first_pts_us.get_or_insert(sample.pts_us);
        stats.last_pts_us = stats.last_pts_us.max(sample.pts_us);
        Ok(WriteOutcome::Written)
    }

    /// Close the container. Idempotent: later calls return the first outcome.
    ///
    /// A container that never started is deleted. If closing fails the file
    /// is deleted and the error returned; later calls report `Discarded`.
    pub fn finalize(&self) -> Result<FinalizeOutcome, WriterError> {
        let mut lifecycle = self.lifecycle.write();
        if let Some(outcome) = &lifecycle.outcome {
            return Ok(outcome.clone());
        }

        let muxer = self.muxer.lock().take();
        let phase = lifecycle.phase;
        lifecycle.phase = Phase::Finalized;

        let outcome = match (phase, muxer) {
            (Phase::Started, Some(mut muxer)) => {
                let finished = muxer.finish();
                drop(muxer);
                if let Err(e) = finished {
                    tracing::error!("Failed to finalize {:?}: {}", self.path, e);
                    self.remove_file();
                    lifecycle.outcome = Some(FinalizeOutcome::Discarded);
                    return Err(e);
                }
                let summary = self.summary();
                tracing::info!(
                    "Container finalized: {:?} ({} bytes, {} dropped before start)",
                    summary.path,
                    summary.file_size,
                    summary.dropped_samples
                );
                FinalizeOutcome::Completed(summary)
            }
            (_, muxer) => {
                if let Some(mut muxer) = muxer {
                    muxer.abort();
                }
                tracing::warn!(
                    "Container never started ({} of {} tracks), deleting {:?}",
                    lifecycle.registered.len(),
                    self.required_tracks,
                    self.path
                );
                self.remove_file();
                FinalizeOutcome::NeverStarted {
                    registered: lifecycle.registered.len(),
                    required: self.required_tracks,
                }
            }
        };

        lifecycle.outcome = Some(outcome.clone());
        Ok(outcome)
    }

    /// Abort and delete the output. No-op once finalized.
    pub fn discard(&self) -> FinalizeOutcome {
        let mut lifecycle = self.lifecycle.write();
        if let Some(outcome) = &lifecycle.outcome {
            return outcome.clone();
        }

        if let Some(mut muxer) = self.muxer.lock().take() {
            muxer.abort();
        }
        lifecycle.phase = Phase::Finalized;
        self.remove_file();
        tracing::info!("Container discarded: {:?}", self.path);

        lifecycle.outcome = Some(FinalizeOutcome::Discarded);
        FinalizeOutcome::Discarded
    }

    fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            path: self.path.clone(),
            tracks: self.tracks.iter().map(|t| t.lock().clone()).collect(),
            dropped_samples: self.dropped.load(Ordering::Relaxed),
            file_size: std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
        }
    }

    fn remove_file(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Deleted {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to delete {:?}: {}", self.path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::mp4::inspect::{find, find_all};
    use crate::encoder::{SampleFlags, TrackParams};
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn video() -> TrackFormat {
        TrackFormat {
            mime: "video/raw".to_string(),
            params: TrackParams::Video {
                width: 4,
                height: 2,
                frame_rate: 30,
                rotation: 0,
            },
            codec_config: Vec::new(),
            bitrate: 0,
        }
    }

    fn audio() -> TrackFormat {
        TrackFormat {
            mime: "audio/raw".to_string(),
            params: TrackParams::Audio {
                sample_rate: 44_100,
                channels: 1,
                bits_per_sample: 16,
            },
            codec_config: Vec::new(),
            bitrate: 0,
        }
    }

    fn sample(pts_us: u64, len: usize) -> EncodedSample {
        EncodedSample::new(vec![9; len], pts_us, SampleFlags::KEY_FRAME)
    }

    struct FailingMuxer;

    impl Muxer for FailingMuxer {
        fn name(&self) -> &str {
            "failing"
        }

        fn add_track(&mut self, _format: &TrackFormat) -> Result<usize, WriterError> {
            Ok(0)
        }

        fn start(&mut self) -> Result<(), WriterError> {
            Ok(())
        }

        fn write_sample(&mut self, _track: usize, _sample: &EncodedSample) -> Result<(), WriterError> {
            Ok(())
        }

        fn finish(&mut self) -> Result<(), WriterError> {
            Err(WriterError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }
    }

    #[test]
    fn test_starts_on_last_registration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let writer = ContainerWriter::create(&path, 2).unwrap();

        let v = writer.register_track(&video()).unwrap();
        assert!(!writer.is_started());
        // Races ahead of the audio registration
        assert_eq!(writer.write_sample(v, &sample(0, 32)).unwrap(), WriteOutcome::Dropped);

        let a = writer.register_track(&audio()).unwrap();
        assert_ne!(v, a);
        assert!(writer.is_started());

        assert_eq!(writer.write_sample(v, &sample(33_000, 32)).unwrap(), WriteOutcome::Written);
        assert_eq!(writer.write_sample(a, &sample(10_000, 8)).unwrap(), WriteOutcome::Written);

        let FinalizeOutcome::Completed(summary) = writer.finalize().unwrap() else {
            panic!("container should complete");
        };
        assert_eq!(summary.dropped_samples, 1);
        assert_eq!(summary.tracks[v.index()].samples, 1);
        assert_eq!(summary.duration_us(), 23_000);

        let data = std::fs::read(&path).unwrap();
        assert_eq!(summary.file_size, data.len() as u64);
        assert_eq!(find(&data, &["mdat"]).unwrap().len(), 40);
        assert_eq!(find_all(&data, &["moov", "trak"]).len(), 2);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let writer = ContainerWriter::create(&path, 1).unwrap();
        let v = writer.register_track(&video()).unwrap();
        writer.write_sample(v, &sample(0, 32)).unwrap();

        let first = writer.finalize().unwrap();
        let size = std::fs::metadata(&path).unwrap().len();
        let second = writer.finalize().unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
    }

    #[test]
    fn test_never_started_deletes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let writer = ContainerWriter::create(&path, 2).unwrap();
        writer.register_track(&video()).unwrap();
        assert!(path.exists());

        let outcome = writer.finalize().unwrap();
        assert_eq!(
            outcome,
            FinalizeOutcome::NeverStarted {
                registered: 1,
                required: 2
            }
        );
        assert!(!path.exists());
        assert_eq!(writer.finalize().unwrap(), outcome);
    }

    #[test]
    fn test_extra_registration_is_contract_violation() {
        let dir = tempdir().unwrap();
        let writer = ContainerWriter::create(&dir.path().join("out.mp4"), 2).unwrap();
        writer.register_track(&video()).unwrap();
        writer.register_track(&audio()).unwrap();

        let err = writer.register_track(&audio()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Contract(ContractViolation::TooManyTracks { required: 2 })
        ));
    }

    #[test]
    fn test_write_after_finalize_fails() {
        let dir = tempdir().unwrap();
        let writer = ContainerWriter::create(&dir.path().join("out.mp4"), 1).unwrap();
        let v = writer.register_track(&video()).unwrap();
        writer.finalize().unwrap();

        let err = writer.write_sample(v, &sample(0, 4)).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Contract(ContractViolation::WriteAfterFinalize)
        ));
    }

    #[test]
    fn test_unknown_track_rejected() {
        let dir = tempdir().unwrap();
        let writer = ContainerWriter::create(&dir.path().join("out.mp4"), 2).unwrap();
        let err = writer.write_sample(TrackHandle(1), &sample(0, 4)).unwrap_err();
        assert!(matches!(err, PipelineError::Contract(ContractViolation::UnknownTrack(1))));
    }

    #[test]
    fn test_discard_removes_started_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let writer = ContainerWriter::create(&path, 1).unwrap();
        let v = writer.register_track(&video()).unwrap();
        writer.write_sample(v, &sample(0, 32)).unwrap();

        assert_eq!(writer.discard(), FinalizeOutcome::Discarded);
        assert!(!path.exists());
        assert_eq!(writer.finalize().unwrap(), FinalizeOutcome::Discarded);
    }

    #[test]
    fn test_failed_finish_deletes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        std::fs::write(&path, b"partial").unwrap();
        let writer = ContainerWriter::with_muxer(&path, 1, Box::new(FailingMuxer)).unwrap();
        writer.register_track(&video()).unwrap();

        assert!(matches!(writer.finalize(), Err(WriterError::Io(_))));
        assert!(!path.exists());
        assert_eq!(writer.finalize().unwrap(), FinalizeOutcome::Discarded);
    }

    #[test]
    fn test_concurrent_registration() {
        let dir = tempdir().unwrap();
        let writer = Arc::new(ContainerWriter::create(&dir.path().join("out.mp4"), 2).unwrap());

        let handles: Vec<_> = [video(), audio()]
            .into_iter()
            .map(|format| {
                let writer = writer.clone();
                thread::spawn(move || writer.register_track(&format).unwrap())
            })
            .collect();
        let mut assigned: Vec<usize> = handles
            .into_iter()
            .map(|h| h.join().unwrap().index())
            .collect();
        assigned.sort();

        assert_eq!(assigned, vec![0, 1]);
        assert!(writer.is_started());
    }

    #[test]
    fn test_zero_required_tracks_rejected() {
        let dir = tempdir().unwrap();
        assert!(ContainerWriter::create(&dir.path().join("out.mp4"), 0).is_err());
    }
}
