//! Encoder output into the shared container

use crate::container::{ContainerWriter, WriteOutcome};
use crate::encoder::{StreamEvent, StreamKind, StreamSink, TrackHandle};
use crate::utils::error::{ContractViolation, ErrorKind, PipelineError};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

const PROGRESS_INTERVAL_US: u64 = 1_000_000;

/// Messages from encoder threads to the session supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The stream delivered its first encoded sample
    FirstSample(StreamKind),
    /// Recorded time of the stream driving progress
    Progress(u64),
    /// The encoder loop failed and has released its resources
    Failed {
        stream: StreamKind,
        kind: ErrorKind,
        message: String,
    },
}

/// Sink registering a stream's track and forwarding its samples
pub struct TrackSink {
    kind: StreamKind,
    writer: Arc<ContainerWriter>,
    handle: Option<TrackHandle>,
    first_sample_seen: bool,
    report_progress: bool,
    next_progress_us: u64,
    events: UnboundedSender<SupervisorEvent>,
}

impl TrackSink {
    pub fn new(
        kind: StreamKind,
        writer: Arc<ContainerWriter>,
        events: UnboundedSender<SupervisorEvent>,
    ) -> Self {
        Self {
            kind,
            writer,
            handle: None,
            first_sample_seen: false,
            report_progress: false,
            next_progress_us: PROGRESS_INTERVAL_US,
            events,
        }
    }

    /// Report recorded time about once per second
    pub fn with_progress_reporting(mut self) -> Self {
        self.report_progress = true;
        self
    }

    pub fn handle(&self) -> Option<TrackHandle> {
        self.handle
    }

    fn notify(&self, event: SupervisorEvent) {
        // Supervisor gone means the session is already being torn down
        let _ = self.events.send(event);
    }
}

impl StreamSink for TrackSink {
    fn send(&mut self, event: StreamEvent) -> Result<(), PipelineError> {
        match event {
            StreamEvent::Format(format) => {
                if self.handle.is_some() {
                    return Err(ContractViolation::FormatChangedTwice(self.kind).into());
                }
                self.handle = Some(self.writer.register_track(&format)?);
            }
            StreamEvent::Sample(sample) => {
                let handle = self
                    .handle
                    .ok_or(ContractViolation::SampleBeforeFormat(self.kind))?;
                let outcome = self.writer.write_sample(handle, &sample)?;

                if !self.first_sample_seen {
                    self.first_sample_seen = true;
                    self.notify(SupervisorEvent::FirstSample(self.kind));
                }

                if self.report_progress
                    && outcome == WriteOutcome::Written
                    && sample.pts_us >= self.next_progress_us
                {
                    self.next_progress_us =
                        (sample.pts_us / PROGRESS_INTERVAL_US + 1) * PROGRESS_INTERVAL_US;
                    self.notify(SupervisorEvent::Progress(sample.pts_us));
                }
            }
            StreamEvent::End => {
                tracing::debug!(
                    "{} stream ended ({})",
                    self.kind,
                    self.handle
                        .map(|h| h.to_string())
                        .unwrap_or_else(|| "no track".to_string())
                );
            }
        }
        Ok(())
    }
}
