//! Stream encoder drain loop
//!
//! One `StreamEncoder` per stream, each run on its own thread. The loop pulls
//! raw input from the capture source, feeds the encoder device and forwards
//! its output to a `StreamSink` as `Format`, `Sample`..., `End`.

use super::device::{CodecRegistry, EncoderDevice, EncoderOutput};
use super::types::{StreamEvent, StreamKind};
use crate::capture::traits::{CaptureSource, PauseStrategy};
use crate::recorder::config::CaptureConfig;
use crate::utils::error::{ConfigError, ContractViolation, PipelineError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default wait on input and output, bounds pause/stop latency
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Default time allowed for the end-of-stream marker after a draining stop
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const STOP_NONE: u8 = 0;
const STOP_DRAIN: u8 = 1;
const STOP_HALT: u8 = 2;

/// Receiver of one stream's output
pub trait StreamSink: Send {
    fn send(&mut self, event: StreamEvent) -> Result<(), PipelineError>;
}

/// Flags shared between the controller (writer) and one encoder loop (reader)
#[derive(Debug, Default)]
pub struct EncoderControl {
    paused: AtomicBool,
    pause_acked: AtomicBool,
    stop: AtomicU8,
}

impl EncoderControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// True once the loop has observed the current pause flag
    pub fn pause_acknowledged(&self) -> bool {
        self.pause_acked.load(Ordering::SeqCst) == self.is_paused()
    }

    /// Ask the loop to stop. A halt request is never downgraded to a drain.
    /// Never blocks.
    pub fn request_stop(&self, drain: bool) {
        let request = if drain { STOP_DRAIN } else { STOP_HALT };
        self.stop.fetch_max(request, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst) != STOP_NONE
    }

    fn acknowledge_pause(&self, paused: bool) {
        self.pause_acked.store(paused, Ordering::SeqCst);
    }

    fn stop_request(&self) -> u8 {
        self.stop.load(Ordering::SeqCst)
    }
}

/// How a stream's loop finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamEnd {
    /// The device emitted its end-of-stream buffer
    EndOfStream,
    /// The device never answered the drain; the stream was ended anyway
    DrainTimeout,
    /// Stopped without draining
    Halted,
}

/// Statistics for one finished stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub kind: StreamKind,
    pub samples: u64,
    pub bytes: u64,
    pub first_pts_us: Option<u64>,
    pub last_pts_us: u64,
    pub end: StreamEnd,
}

impl StreamSummary {
    fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            samples: 0,
            bytes: 0,
            first_pts_us: None,
            last_pts_us: 0,
            end: StreamEnd::Halted,
        }
    }
}

/// A configured encoder owning its capture source and device
pub struct StreamEncoder {
    kind: StreamKind,
    source: Box<dyn CaptureSource>,
    device: Box<dyn EncoderDevice>,
    control: Arc<EncoderControl>,
    pause_strategy: PauseStrategy,
    poll_timeout: Duration,
    drain_timeout: Duration,
    released: bool,
}

impl StreamEncoder {
    /// Open an encoder device for `config` and bind it to `source`.
    ///
    /// The source is released if configuration fails.
    pub fn configure(
        config: &CaptureConfig,
        mut source: Box<dyn CaptureSource>,
        codecs: &dyn CodecRegistry,
    ) -> Result<Self, ConfigError> {
        if source.kind() != config.kind() {
            source.release();
            return Err(ConfigError::InvalidParameter(format!(
                "{} source bound to {} encoder",
                source.kind(),
                config.kind()
            )));
        }

        match codecs.create_encoder(config) {
            Ok(device) => {
                tracing::debug!("Configured {} encoder {}", config.kind(), device.name());
                Ok(Self::from_parts(source, device))
            }
            Err(e) => {
                source.release();
                Err(e)
            }
        }
    }

    /// Pair an already opened device with its source
    pub fn from_parts(source: Box<dyn CaptureSource>, device: Box<dyn EncoderDevice>) -> Self {
        Self {
            kind: source.kind(),
            source,
            device,
            control: EncoderControl::new(),
            pause_strategy: PauseStrategy::IdleInPlace,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            released: false,
        }
    }

    pub fn with_timeouts(mut self, poll_timeout: Duration, drain_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_pause_strategy(mut self, strategy: PauseStrategy) -> Self {
        self.pause_strategy = strategy;
        self
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Handle for pausing and stopping the loop from other threads
    pub fn control(&self) -> Arc<EncoderControl> {
        self.control.clone()
    }

    pub fn request_stop(&self, drain: bool) {
        self.control.request_stop(drain);
    }

    /// Run the drain loop to completion. Blocks the calling thread.
    ///
    /// Source and device are released on every exit path.
    pub fn run(mut self, sink: &mut dyn StreamSink) -> Result<StreamSummary, PipelineError> {
        tracing::info!("{} encoder running on {}", self.kind, self.device.name());
        let result = self.drain_loop(sink);
        self.release();

        match &result {
            Ok(summary) => tracing::info!(
                "{} encoder finished ({:?}): {} samples, {} bytes",
                self.kind,
                summary.end,
                summary.samples,
                summary.bytes
            ),
            Err(e) => tracing::error!("{} encoder failed: {}", self.kind, e),
        }
        result
    }

    fn drain_loop(&mut self, sink: &mut dyn StreamSink) -> Result<StreamSummary, PipelineError> {
        let mut summary = StreamSummary::new(self.kind);
        let mut format_seen = false;
        let mut suspended = false;
        let mut last_input_pts = 0u64;
        let mut eos_queued_at: Option<Instant> = None;

        loop {
            match self.control.stop_request() {
                STOP_HALT => {
                    tracing::debug!("{} encoder halted", self.kind);
                    summary.end = StreamEnd::Halted;
                    return Ok(summary);
                }
                STOP_DRAIN if eos_queued_at.is_none() => {
                    tracing::debug!("{} encoder draining", self.kind);
                    self.device.signal_end_of_input(last_input_pts)?;
                    eos_queued_at = Some(Instant::now());
                }
                _ => {}
            }

            if eos_queued_at.is_none() {
                if self.control.is_paused() {
                    if !suspended {
                        if self.pause_strategy == PauseStrategy::ReleaseAndReacquire {
                            self.source.suspend()?;
                        }
                        suspended = true;
                        self.control.acknowledge_pause(true);
                        tracing::debug!("{} encoder paused", self.kind);
                    }
                    // Raw input stays queued at the source while paused
                    std::thread::sleep(self.poll_timeout);
                    continue;
                }

                if suspended {
                    if self.pause_strategy == PauseStrategy::ReleaseAndReacquire {
                        self.source.resume()?;
                    }
                    suspended = false;
                    self.control.acknowledge_pause(false);
                    tracing::debug!("{} encoder resumed", self.kind);
                }

                if let Some(chunk) = self.source.read(self.poll_timeout)? {
                    last_input_pts = last_input_pts.max(chunk.pts_us);
                    self.device.queue_input(chunk)?;
                }
            }

            let timeout = if eos_queued_at.is_some() {
                self.poll_timeout
            } else {
                Duration::ZERO
            };

            loop {
                match self.device.dequeue_output(timeout)? {
                    EncoderOutput::TryAgainLater => break,
                    EncoderOutput::FormatChanged(format) => {
                        if format_seen {
                            return Err(ContractViolation::FormatChangedTwice(self.kind).into());
                        }
                        format_seen = true;
                        tracing::info!("{} output format ready: {}", self.kind, format.mime);
                        sink.send(StreamEvent::Format(format))?;
                    }
                    EncoderOutput::Sample(sample) if sample.is_end_of_stream() => {
                        tracing::debug!("{} encoder reached end of stream", self.kind);
                        sink.send(StreamEvent::End)?;
                        summary.end = StreamEnd::EndOfStream;
                        return Ok(summary);
                    }
                    EncoderOutput::Sample(sample) if sample.flags.codec_config => {
                        // Already carried by the format
                        continue;
                    }
                    EncoderOutput::Sample(mut sample) => {
                        if !format_seen {
                            return Err(ContractViolation::SampleBeforeFormat(self.kind).into());
                        }
                        if sample.pts_us < summary.last_pts_us {
                            tracing::trace!(
                                "{} pts {} behind {}, clamped",
                                self.kind,
                                sample.pts_us,
                                summary.last_pts_us
                            );
                            sample.pts_us = summary.last_pts_us;
                        }
                        summary.samples += 1;
                        summary.bytes += sample.data.len() as u64;
                        summary.first_pts_us.get_or_insert(sample.pts_us);
                        summary.last_pts_us = sample.pts_us;
                        sink.send(StreamEvent::Sample(sample))?;
                    }
                }
            }

            if let Some(queued_at) = eos_queued_at {
                if queued_at.elapsed() >= self.drain_timeout {
                    tracing::warn!(
                        "{} encoder produced no end of stream within {:?}, ending stream",
                        self.kind,
                        self.drain_timeout
                    );
                    sink.send(StreamEvent::End)?;
                    summary.end = StreamEnd::DrainTimeout;
                    return Ok(summary);
                }
            }
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.source.release();
            self.device.release();
            tracing::debug!("{} encoder resources released", self.kind);
        }
    }
}

impl Drop for StreamEncoder {
    fn drop(&mut self) {
        self.release();
    }
}
