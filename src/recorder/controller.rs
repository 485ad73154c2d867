//! Pipeline controller
//!
//! Owns the single active session: starts both encoders on their own threads,
//! relays pause/resume, and tears everything down on stop or failure. Results
//! go to the `ResultCallback` and to broadcast subscribers.

use super::callback::{RecordingEvent, ResultCallback};
use super::config::{
    fit_resolution, AudioConfig, AudioSource, CaptureConfig, DeviceProfile, RecorderSettings,
    VideoCodec, VideoConfig,
};
use super::sink::{SupervisorEvent, TrackSink};
use super::state::{
    recorded_ms, PipelineState, RecordingOutput, RecordingSegment, SessionHandle,
};
use crate::capture::{AudioCapture, CaptureSource, DisplayCapture, SessionClock};
use crate::container::{ContainerWriter, FinalizeOutcome, Mp4MuxerFactory, MuxerFactory};
use crate::encoder::{
    best_audio_codec, best_video_codec, CodecRegistry, EncoderControl, SoftwareCodecs,
    StreamEncoder, StreamKind, StreamSummary,
};
use crate::utils::error::{
    CaptureError, ConfigError, ErrorKind, PipelineError, PipelineResult, WriterError,
};
use crate::utils::storage::{self, DiskSpaceProbe, StorageProbe};
use chrono::{Local, Utc};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Platform capabilities the pipeline consumes
#[derive(Clone)]
pub struct Capabilities {
    pub display: Arc<dyn DisplayCapture>,
    pub audio: Arc<dyn AudioCapture>,
    pub codecs: Arc<dyn CodecRegistry>,
    pub storage: Arc<dyn StorageProbe>,
    pub muxers: Arc<dyn MuxerFactory>,
}

impl Capabilities {
    /// Software codecs and MP4 output, checked against the system disk
    pub fn new(display: Arc<dyn DisplayCapture>, audio: Arc<dyn AudioCapture>) -> Self {
        Self {
            display,
            audio,
            codecs: Arc::new(SoftwareCodecs::new()),
            storage: Arc::new(DiskSpaceProbe),
            muxers: Arc::new(Mp4MuxerFactory),
        }
    }

    pub fn with_codecs(mut self, codecs: Arc<dyn CodecRegistry>) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageProbe>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_muxers(mut self, muxers: Arc<dyn MuxerFactory>) -> Self {
        self.muxers = muxers;
        self
    }
}

struct EncoderThread {
    kind: StreamKind,
    control: Arc<EncoderControl>,
    thread: JoinHandle<PipelineResult<StreamSummary>>,
}

impl EncoderThread {
    fn spawn(
        encoder: StreamEncoder,
        writer: Arc<ContainerWriter>,
        events: mpsc::UnboundedSender<SupervisorEvent>,
        report_progress: bool,
    ) -> Result<Self, ConfigError> {
        let kind = encoder.kind();
        let control = encoder.control();
        let thread = std::thread::Builder::new()
            .name(format!("{}-encoder", kind))
            .spawn(move || {
                let mut sink = TrackSink::new(kind, writer, events.clone());
                if report_progress {
                    sink = sink.with_progress_reporting();
                }
                let result = encoder.run(&mut sink);
                if let Err(e) = &result {
                    let _ = events.send(SupervisorEvent::Failed {
                        stream: kind,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
                result
            })?;
        Ok(Self {
            kind,
            control,
            thread,
        })
    }

    fn join(self) -> (StreamKind, PipelineResult<StreamSummary>) {
        let kind = self.kind;
        let result = self.thread.join().unwrap_or_else(|_| {
            Err(CaptureError::Encoder {
                kind,
                reason: "encoder thread panicked".to_string(),
            }
            .into())
        });
        (kind, result)
    }
}

/// Join encoder threads without blocking the runtime
async fn join_encoders(
    encoders: Vec<EncoderThread>,
) -> Vec<(StreamKind, PipelineResult<StreamSummary>)> {
    let kinds: Vec<StreamKind> = encoders.iter().map(|e| e.kind).collect();
    let joined = tokio::task::spawn_blocking(move || {
        encoders.into_iter().map(EncoderThread::join).collect::<Vec<_>>()
    })
    .await;

    match joined {
        Ok(results) => results,
        Err(e) => kinds
            .into_iter()
            .map(|kind| {
                let error = CaptureError::Interrupted(format!("joining {} encoder: {}", kind, e));
                (kind, Err(error.into()))
            })
            .collect(),
    }
}

struct ActiveSession {
    handle: SessionHandle,
    /// A display capture session is held and must be released
    display_acquired: bool,
    writer: Arc<ContainerWriter>,
    clock: SessionClock,
    encoders: Vec<EncoderThread>,
    segments: Vec<RecordingSegment>,
    started: Instant,
    storage_watch: Option<tokio::task::JoinHandle<()>>,
}

impl ActiveSession {
    fn process_time_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    fn controls(&self) -> Vec<Arc<EncoderControl>> {
        self.encoders.iter().map(|e| e.control.clone()).collect()
    }

    fn end_segment(&mut self) {
        let now = self.process_time_ms();
        if let Some(segment) = self.segments.last_mut() {
            segment.end(now);
        }
    }

    fn stop_watch(&mut self) {
        if let Some(task) = self.storage_watch.take() {
            task.abort();
        }
    }
}

struct Shared {
    state: RwLock<PipelineState>,
    settings: RecorderSettings,
    caps: Capabilities,
    callback: Arc<dyn ResultCallback>,
    events: broadcast::Sender<RecordingEvent>,
    session: Mutex<Option<ActiveSession>>,
    last_segments: Mutex<Vec<RecordingSegment>>,
    /// Serializes start/pause/resume/stop; contenders are rejected
    ops: tokio::sync::Mutex<()>,
}

impl Shared {
    fn state(&self) -> PipelineState {
        *self.state.read()
    }

    fn emit(&self, event: RecordingEvent) {
        let _ = self.events.send(event);
    }

    /// Move to `to` if the current state is one of `from`
    fn transition(
        &self,
        from: &[PipelineState],
        to: PipelineState,
    ) -> Result<PipelineState, PipelineError> {
        let mut state = self.state.write();
        let current = *state;
        if !from.contains(&current) {
            return Err(PipelineError::InvalidState(current));
        }
        *state = to;
        drop(state);

        tracing::info!("Pipeline {:?} -> {:?}", current, to);
        self.emit(RecordingEvent::StateChanged { state: to });
        Ok(current)
    }

    fn set_state(&self, to: PipelineState) {
        let previous = std::mem::replace(&mut *self.state.write(), to);
        tracing::info!("Pipeline {:?} -> {:?}", previous, to);
        self.emit(RecordingEvent::StateChanged { state: to });
    }

    fn report_error(&self, kind: ErrorKind, message: &str) {
        self.callback.on_error(kind, message);
        self.emit(RecordingEvent::Error {
            kind,
            message: message.to_string(),
        });
    }

    fn is_current(&self, id: Uuid) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.handle.id == id)
            .unwrap_or(false)
    }

    /// Take the session if it is still `id`
    fn take_session(&self, id: Uuid) -> Option<ActiveSession> {
        let mut guard = self.session.lock();
        match guard.as_ref() {
            Some(session) if session.handle.id == id => guard.take(),
            _ => None,
        }
    }

    fn release_display(&self, session: &ActiveSession) {
        if session.display_acquired {
            self.caps.display.release();
        }
    }

    /// Tear down a session after an unrecoverable error: halt every encoder,
    /// delete the output, release the display.
    async fn fail_session(&self, mut session: ActiveSession, kind: ErrorKind, message: String) {
        tracing::error!("Session {} failed: {}", session.handle.id, message);
        // Lifecycle requests are rejected until the teardown is over
        let _op = self.ops.lock().await;
        session.stop_watch();
        session.end_segment();

        for encoder in &session.encoders {
            encoder.control.request_stop(false);
        }
        let encoders = std::mem::take(&mut session.encoders);
        for (stream, result) in join_encoders(encoders).await {
            if let Err(e) = result {
                tracing::debug!("{} encoder ended with: {}", stream, e);
            }
        }

        session.writer.discard();
        self.release_display(&session);
        *self.last_segments.lock() = std::mem::take(&mut session.segments);

        self.report_error(kind, &message);
        self.set_state(PipelineState::Failed);
    }
}

/// Recording pipeline entry point.
///
/// Cheap to clone; clones share the same pipeline.
#[derive(Clone)]
pub struct PipelineController {
    shared: Arc<Shared>,
}

impl PipelineController {
    pub fn new(
        settings: RecorderSettings,
        caps: Capabilities,
        callback: Arc<dyn ResultCallback>,
    ) -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(PipelineState::Idle),
                settings,
                caps,
                callback,
                events,
                session: Mutex::new(None),
                last_segments: Mutex::new(Vec::new()),
                ops: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn settings(&self) -> &RecorderSettings {
        &self.shared.settings
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.shared.events.subscribe()
    }

    /// The active session, if any
    pub fn session(&self) -> Option<SessionHandle> {
        self.shared.session.lock().as_ref().map(|s| s.handle.clone())
    }

    /// Recorded time in milliseconds, pauses excluded. Reports the last
    /// session once it has ended.
    pub fn duration_ms(&self) -> f64 {
        if let Some(session) = self.shared.session.lock().as_ref() {
            return recorded_ms(&session.segments, session.process_time_ms());
        }
        recorded_ms(&self.shared.last_segments.lock(), 0.0)
    }

    /// Derive a config pair from the default display, the codec registry and
    /// the settings
    pub async fn session_configs(&self) -> Result<(VideoConfig, AudioConfig), ConfigError> {
        let settings = &self.shared.settings;
        let caps = &self.shared.caps;

        let display = caps.display.default_display().await?;
        let preferences: Vec<VideoCodec> = match settings.profile {
            // HEVC is too heavy for low-RAM devices
            DeviceProfile::LowRam => settings
                .video_codecs
                .iter()
                .copied()
                .filter(|c| *c != VideoCodec::Hevc)
                .collect(),
            DeviceProfile::Standard => settings.video_codecs.clone(),
        };
        let codec = best_video_codec(caps.codecs.as_ref(), &preferences)
            .ok_or_else(|| ConfigError::Unsupported("no video encoder available".to_string()))?;

        let mut video = VideoConfig::for_display(&display, settings.profile, codec);
        if let Some(limits) = caps.codecs.video_caps(codec) {
            let (width, height) =
                fit_resolution(video.width, video.height, &limits, settings.max_dimension);
            if (width, height) != (video.width, video.height) {
                tracing::info!(
                    "Display {}x{} recorded at {}x{}",
                    video.width,
                    video.height,
                    width,
                    height
                );
            }
            video.width = width;
            video.height = height;
            video.bitrate = video.bitrate.min(limits.max_bitrate);
        }

        let audio = match settings.audio_source {
            AudioSource::Disabled => AudioConfig::disabled(),
            source => {
                let codec = best_audio_codec(caps.codecs.as_ref(), &settings.audio_codecs)
                    .ok_or_else(|| {
                        ConfigError::Unsupported("no audio encoder available".to_string())
                    })?;
                AudioConfig::for_source(source, codec)
            }
        };
        Ok((video, audio))
    }

    /// Start a session. `None` video records audio only; disabled audio
    /// records video only.
    ///
    /// Rejected unless the pipeline is Idle, Stopped or Failed. On error
    /// nothing stays open and the pipeline returns to Idle.
    pub async fn start(
        &self,
        video: Option<VideoConfig>,
        audio: AudioConfig,
    ) -> PipelineResult<SessionHandle> {
        let _op = self
            .shared
            .ops
            .try_lock()
            .map_err(|_| PipelineError::InvalidState(self.state()))?;
        self.shared.transition(
            &[
                PipelineState::Idle,
                PipelineState::Stopped,
                PipelineState::Failed,
            ],
            PipelineState::Starting,
        )?;

        match self.open_session(video, audio).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                tracing::error!("Failed to start recording: {}", e);
                self.shared.set_state(PipelineState::Idle);
                self.shared.report_error(e.kind(), &e.to_string());
                Err(e)
            }
        }
    }

    async fn open_session(
        &self,
        video: Option<VideoConfig>,
        audio: AudioConfig,
    ) -> PipelineResult<SessionHandle> {
        let shared = &self.shared;
        let settings = &shared.settings;
        let caps = &shared.caps;

        if video.is_none() && !audio.is_enabled() {
            return Err(ConfigError::InvalidParameter(
                "both video and audio are disabled".to_string(),
            )
            .into());
        }
        if let Some(video) = &video {
            video.validate()?;
        }
        audio.validate()?;

        let output_dir = settings.output_dir();
        std::fs::create_dir_all(&output_dir).map_err(ConfigError::from)?;
        storage::ensure_free_space(caps.storage.as_ref(), &output_dir, settings.min_free_bytes)?;
        let output_path = storage::unique_output_path(&output_dir, Local::now());

        match &video {
            Some(video) => tracing::info!(
                "Starting recording to {:?} ({}x{} {:?}, audio {:?})",
                output_path,
                video.width,
                video.height,
                video.codec,
                audio.source
            ),
            None => tracing::info!(
                "Starting audio recording to {:?} ({:?})",
                output_path,
                audio.source
            ),
        };

        let clock = SessionClock::new();
        let video = match video {
            Some(config) => {
                let source = caps.display.mirror(&config, clock.clone()).await?;
                Some((config, source))
            }
            None => None,
        };
        // The display session is open from here on
        let display_acquired = video.is_some();

        let opened = self
            .spawn_encoders(video, &audio, clock.clone(), &output_path)
            .await;
        let (writer, encoders, events_rx) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                if display_acquired {
                    caps.display.release();
                }
                return Err(e);
            }
        };

        let handle = SessionHandle {
            id: Uuid::new_v4(),
            output_path,
            started_at: Utc::now(),
            video_enabled: display_acquired,
            audio_enabled: audio.is_enabled(),
        };
        let expected: Vec<StreamKind> = encoders.iter().map(|e| e.kind).collect();

        let storage_watch = tokio::spawn(watch_storage(self.clone(), handle.id, output_dir));
        *shared.session.lock() = Some(ActiveSession {
            handle: handle.clone(),
            display_acquired,
            writer,
            clock,
            encoders,
            segments: vec![RecordingSegment::new(0, 0.0)],
            started: Instant::now(),
            storage_watch: Some(storage_watch),
        });
        tokio::spawn(supervise(self.clone(), handle.id, expected, events_rx));

        Ok(handle)
    }

    async fn spawn_encoders(
        &self,
        video: Option<(VideoConfig, Box<dyn CaptureSource>)>,
        audio: &AudioConfig,
        clock: SessionClock,
        output_path: &Path,
    ) -> PipelineResult<(
        Arc<ContainerWriter>,
        Vec<EncoderThread>,
        mpsc::UnboundedReceiver<SupervisorEvent>,
    )> {
        let settings = &self.shared.settings;
        let caps = &self.shared.caps;

        let video_encoder = match video {
            Some((config, source)) => Some(
                StreamEncoder::configure(&CaptureConfig::Video(config), source, caps.codecs.as_ref())?
                    .with_timeouts(settings.poll_timeout(), settings.drain_timeout())
                    .with_pause_strategy(caps.display.pause_strategy()),
            ),
            None => None,
        };

        let audio_encoder = if audio.is_enabled() {
            let source = caps.audio.open(audio, clock).await?;
            let encoder = StreamEncoder::configure(
                &CaptureConfig::Audio(audio.clone()),
                source,
                caps.codecs.as_ref(),
            )?
            .with_timeouts(settings.poll_timeout(), settings.drain_timeout())
            .with_pause_strategy(caps.audio.pause_strategy());
            Some(encoder)
        } else {
            None
        };

        let streams: Vec<StreamEncoder> = video_encoder.into_iter().chain(audio_encoder).collect();
        let writer = Arc::new(ContainerWriter::open(
            caps.muxers.as_ref(),
            output_path,
            streams.len(),
        )?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Progress follows the first stream: video when recorded, else audio
        let mut encoders = Vec::with_capacity(streams.len());
        for (index, encoder) in streams.into_iter().enumerate() {
            match EncoderThread::spawn(encoder, writer.clone(), events_tx.clone(), index == 0) {
                Ok(thread) => encoders.push(thread),
                Err(e) => {
                    for running in &encoders {
                        running.control.request_stop(false);
                    }
                    join_encoders(encoders).await;
                    writer.discard();
                    return Err(e.into());
                }
            }
        }

        Ok((writer, encoders, events_rx))
    }

    /// Pause both streams. Returns once both encoders stopped pulling input.
    pub async fn pause(&self) -> PipelineResult<()> {
        let _op = self
            .shared
            .ops
            .try_lock()
            .map_err(|_| PipelineError::InvalidState(self.state()))?;
        self.shared
            .transition(&[PipelineState::Running], PipelineState::Pausing)?;

        let (id, controls, clock) = {
            let mut guard = self.shared.session.lock();
            let Some(session) = guard.as_mut() else {
                return Err(PipelineError::InvalidState(self.state()));
            };
            session.end_segment();
            (session.handle.id, session.controls(), session.clock.clone())
        };

        for control in &controls {
            control.set_paused(true);
        }
        self.await_acknowledgement(id, &controls).await;
        if !self.shared.is_current(id) {
            return Err(PipelineError::InvalidState(self.state()));
        }
        // Encoders no longer read; freeze time for the gap
        clock.pause();

        self.shared
            .transition(&[PipelineState::Pausing], PipelineState::Paused)?;
        self.shared.emit(RecordingEvent::Paused);
        Ok(())
    }

    /// Resume both streams. Returns once capture is flowing again.
    pub async fn resume(&self) -> PipelineResult<()> {
        let _op = self
            .shared
            .ops
            .try_lock()
            .map_err(|_| PipelineError::InvalidState(self.state()))?;
        let state = self.state();
        if state != PipelineState::Paused {
            return Err(PipelineError::InvalidState(state));
        }

        let (id, controls) = {
            let mut guard = self.shared.session.lock();
            let Some(session) = guard.as_mut() else {
                return Err(PipelineError::InvalidState(self.state()));
            };
            let index = session.segments.len();
            let now = session.process_time_ms();
            session.segments.push(RecordingSegment::new(index, now));
            session.clock.resume();
            (session.handle.id, session.controls())
        };

        for control in &controls {
            control.set_paused(false);
        }
        self.await_acknowledgement(id, &controls).await;
        if !self.shared.is_current(id) {
            return Err(PipelineError::InvalidState(self.state()));
        }

        self.shared
            .transition(&[PipelineState::Paused], PipelineState::Running)?;
        self.shared.emit(RecordingEvent::Resumed);
        Ok(())
    }

    async fn await_acknowledgement(&self, id: Uuid, controls: &[Arc<EncoderControl>]) {
        let poll = self.shared.settings.poll_timeout();
        let deadline = Instant::now() + self.shared.settings.drain_timeout().max(poll * 10);

        while !controls.iter().all(|c| c.pause_acknowledged()) {
            if !self.shared.is_current(id) {
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!("Encoders did not acknowledge pause change in time");
                return;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Wait until the session ends on its own, by a storage stop or a
    /// failure, and return the state it settled in. `events` must be
    /// subscribed before `start`.
    pub async fn wait_ended(
        &self,
        events: &mut broadcast::Receiver<RecordingEvent>,
    ) -> PipelineState {
        loop {
            match events.recv().await {
                Ok(RecordingEvent::Stopped { .. }) | Ok(RecordingEvent::Error { .. }) => break,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        // Errors are announced before the teardown completes
        let poll = self.shared.settings.poll_timeout();
        while !self.state().is_quiescent() {
            tokio::time::sleep(poll).await;
        }
        self.state()
    }

    /// Drain both encoders, finalize the container and release the display.
    ///
    /// Blocks until the file is closed. On success `on_stopped` has been
    /// called with the output path.
    pub async fn stop(&self) -> PipelineResult<RecordingOutput> {
        let _op = self
            .shared
            .ops
            .try_lock()
            .map_err(|_| PipelineError::InvalidState(self.state()))?;
        self.shared.transition(
            &[
                PipelineState::Starting,
                PipelineState::Running,
                PipelineState::Paused,
            ],
            PipelineState::Stopping,
        )?;

        let Some(session) = self.shared.session.lock().take() else {
            // Claimed by the failure path, which reports the outcome
            return Err(PipelineError::InvalidState(PipelineState::Stopping));
        };
        self.finish_session(session).await
    }

    async fn finish_session(&self, mut session: ActiveSession) -> PipelineResult<RecordingOutput> {
        let shared = &self.shared;
        session.stop_watch();
        session.end_segment();

        for encoder in &session.encoders {
            encoder.control.request_stop(true);
        }
        let encoders = std::mem::take(&mut session.encoders);

        let mut failure: Option<PipelineError> = None;
        for (stream, result) in join_encoders(encoders).await {
            match result {
                Ok(summary) => tracing::debug!(
                    "{} stream: {} samples ({:?})",
                    stream,
                    summary.samples,
                    summary.end
                ),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        let outcome = match failure {
            Some(e) => {
                session.writer.discard();
                Err(e)
            }
            None => match session.writer.finalize() {
                Ok(FinalizeOutcome::Completed(summary)) => Ok(summary),
                Ok(FinalizeOutcome::NeverStarted {
                    registered,
                    required,
                }) => Err(WriterError::NeverStarted {
                    registered,
                    required,
                }
                .into()),
                Ok(FinalizeOutcome::Discarded) => {
                    Err(WriterError::Muxer("container was discarded".to_string()).into())
                }
                Err(e) => Err(e.into()),
            },
        };

        shared.release_display(&session);
        let segments = std::mem::take(&mut session.segments);
        *shared.last_segments.lock() = segments.clone();

        match outcome {
            Ok(container) => {
                let output = RecordingOutput {
                    session_id: session.handle.id,
                    output_path: session.handle.output_path.clone(),
                    total_duration_ms: recorded_ms(&segments, 0.0),
                    segments,
                    container,
                };
                shared.set_state(PipelineState::Stopped);
                shared.callback.on_stopped(&output.output_path);
                shared.emit(RecordingEvent::Stopped {
                    output_path: output.output_path.clone(),
                });
                tracing::info!(
                    "Recording stopped. Duration: {:.0}ms",
                    output.total_duration_ms
                );
                Ok(output)
            }
            Err(e) => {
                tracing::error!("Recording failed while stopping: {}", e);
                shared.set_state(PipelineState::Failed);
                shared.report_error(e.kind(), &e.to_string());
                Err(e)
            }
        }
    }

    /// External cancellation (display off, capture revoked): halt both
    /// encoders without draining and fail the session.
    pub async fn abort(&self, reason: &str) -> PipelineResult<()> {
        let id = self
            .session()
            .map(|s| s.id)
            .ok_or_else(|| PipelineError::InvalidState(self.state()))?;
        let Some(session) = self.shared.take_session(id) else {
            return Err(PipelineError::InvalidState(self.state()));
        };

        let error = PipelineError::from(CaptureError::Interrupted(reason.to_string()));
        self.shared
            .fail_session(session, error.kind(), error.to_string())
            .await;
        Ok(())
    }
}

/// Per-session task turning encoder reports into state changes and callbacks
async fn supervise(
    controller: PipelineController,
    id: Uuid,
    mut waiting: Vec<StreamKind>,
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
) {
    let shared = &controller.shared;
    let mut started = false;
    while let Some(event) = events.recv().await {
        match event {
            SupervisorEvent::FirstSample(kind) => {
                waiting.retain(|k| *k != kind);
                if waiting.is_empty()
                    && shared
                        .transition(&[PipelineState::Starting], PipelineState::Running)
                        .is_ok()
                {
                    started = true;
                    shared.callback.on_started();
                    shared.emit(RecordingEvent::Started);
                }
            }
            // Progress is only reported once the session has started
            SupervisorEvent::Progress(_) if !started => {}
            SupervisorEvent::Progress(elapsed_us) => {
                shared.callback.on_progress(elapsed_us);
                shared.emit(RecordingEvent::Progress { elapsed_us });
            }
            SupervisorEvent::Failed {
                stream,
                kind,
                message,
            } => {
                // A stop in progress already owns the session and reports it
                if let Some(session) = shared.take_session(id) {
                    tracing::warn!("{} encoder failed, failing session", stream);
                    shared.fail_session(session, kind, message).await;
                }
                return;
            }
        }
    }
    tracing::debug!("Supervisor for session {} finished", id);
}

/// Periodic free-space check; below the floor the session is stopped and
/// the recording kept
async fn watch_storage(controller: PipelineController, id: Uuid, dir: PathBuf) {
    let shared = controller.shared.clone();
    let mut ticker = tokio::time::interval(shared.settings.storage_check_interval());
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !shared.is_current(id) {
            return;
        }

        match storage::ensure_free_space(
            shared.caps.storage.as_ref(),
            &dir,
            shared.settings.min_free_bytes,
        ) {
            Ok(_) => {}
            Err(ConfigError::InsufficientStorage {
                available,
                required,
            }) => {
                tracing::warn!("Storage low ({} bytes free), stopping recording", available);
                shared.emit(RecordingEvent::StorageLow {
                    available,
                    required,
                });
                // stop() aborts this task, so it runs on its own
                let stopper = controller.clone();
                tokio::spawn(async move {
                    if let Err(e) = stopper.stop().await {
                        tracing::debug!("Storage stop not applied: {}", e);
                    }
                });
                // Retried on the next tick if the stop was rejected
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => tracing::debug!("Free space check failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::traits::{DisplayInfo, PauseStrategy};
    use crate::capture::{pcm_queue, PcmConsumer, SyntheticAudio, SyntheticDisplay};
    use crate::container::mp4::inspect::{find, find_all, u32_at};
    use crate::container::Muxer;
    use crate::encoder::{EncodedSample, RawChunk, TrackFormat};
    use crate::recorder::config::AudioCodec;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Started,
        Progress(u64),
        Stopped(PathBuf),
        Error(ErrorKind, String),
    }

    #[derive(Default)]
    struct RecordingCallback {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingCallback {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn errors(&self) -> Vec<(ErrorKind, String)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Error(kind, message) => Some((kind, message)),
                    _ => None,
                })
                .collect()
        }

        fn stopped(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Stopped(_)))
                .count()
        }
    }

    impl ResultCallback for RecordingCallback {
        fn on_started(&self) {
            self.calls.lock().push(Call::Started);
        }

        fn on_progress(&self, elapsed_us: u64) {
            self.calls.lock().push(Call::Progress(elapsed_us));
        }

        fn on_stopped(&self, output_path: &Path) {
            self.calls.lock().push(Call::Stopped(output_path.to_path_buf()));
        }

        fn on_error(&self, kind: ErrorKind, message: &str) {
            self.calls.lock().push(Call::Error(kind, message.to_string()));
        }
    }

    /// Synthetic display counting mirror and release calls
    struct CountingDisplay {
        inner: SyntheticDisplay,
        mirrors: AtomicUsize,
        releases: AtomicUsize,
    }

    impl CountingDisplay {
        fn new() -> Self {
            Self {
                inner: SyntheticDisplay::new(64, 32),
                mirrors: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DisplayCapture for CountingDisplay {
        fn name(&self) -> &str {
            "counting"
        }

        fn pause_strategy(&self) -> PauseStrategy {
            PauseStrategy::ReleaseAndReacquire
        }

        async fn default_display(&self) -> Result<DisplayInfo, ConfigError> {
            self.inner.default_display().await
        }

        async fn mirror(
            &self,
            config: &VideoConfig,
            clock: SessionClock,
        ) -> Result<Box<dyn CaptureSource>, ConfigError> {
            self.mirrors.fetch_add(1, Ordering::SeqCst);
            self.inner.mirror(config, clock).await
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Audio capture whose source dies after a number of reads
    struct FlakyAudio {
        fail_after: usize,
    }

    struct FlakySource {
        reads: usize,
        fail_after: usize,
        clock: SessionClock,
    }

    impl CaptureSource for FlakySource {
        fn kind(&self) -> StreamKind {
            StreamKind::Audio
        }

        fn read(&mut self, timeout: Duration) -> Result<Option<RawChunk>, CaptureError> {
            std::thread::sleep(timeout);
            self.reads += 1;
            if self.reads > self.fail_after {
                return Err(CaptureError::SourceLost {
                    kind: StreamKind::Audio,
                    reason: "device unplugged".to_string(),
                });
            }
            Ok(Some(RawChunk {
                data: vec![0; 512],
                pts_us: self.clock.now_us(),
            }))
        }

        fn release(&mut self) {}
    }

    #[async_trait]
    impl AudioCapture for FlakyAudio {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn open(
            &self,
            _config: &AudioConfig,
            clock: SessionClock,
        ) -> Result<Box<dyn CaptureSource>, ConfigError> {
            Ok(Box::new(FlakySource {
                reads: 0,
                fail_after: self.fail_after,
                clock,
            }))
        }
    }

    /// Audio capture fed from a callback thread every 10 ms, like cpal
    struct CallbackAudio;

    struct CallbackSource {
        queue: PcmConsumer,
        running: Arc<AtomicBool>,
        feeder: Option<std::thread::JoinHandle<()>>,
    }

    impl CaptureSource for CallbackSource {
        fn kind(&self) -> StreamKind {
            StreamKind::Audio
        }

        fn read(&mut self, timeout: Duration) -> Result<Option<RawChunk>, CaptureError> {
            self.queue.read(timeout)
        }

        fn suspend(&mut self) -> Result<(), CaptureError> {
            self.queue.suspend();
            Ok(())
        }

        fn resume(&mut self) -> Result<(), CaptureError> {
            self.queue.resume();
            Ok(())
        }

        fn release(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(feeder) = self.feeder.take() {
                let _ = feeder.join();
            }
        }
    }

    #[async_trait]
    impl AudioCapture for CallbackAudio {
        fn name(&self) -> &str {
            "callback"
        }

        fn pause_strategy(&self) -> PauseStrategy {
            PauseStrategy::ReleaseAndReacquire
        }

        async fn open(
            &self,
            _config: &AudioConfig,
            clock: SessionClock,
        ) -> Result<Box<dyn CaptureSource>, ConfigError> {
            let (producer, queue) = pcm_queue(clock);
            let running = Arc::new(AtomicBool::new(true));
            let flag = running.clone();
            let feeder = std::thread::spawn(move || {
                while flag.load(Ordering::SeqCst) {
                    // 10 ms of mono 44.1 kHz
                    producer.push_pcm(vec![0; 882]);
                    std::thread::sleep(Duration::from_millis(10));
                }
            });
            Ok(Box::new(CallbackSource {
                queue,
                running,
                feeder: Some(feeder),
            }))
        }
    }

    /// MP4 output whose disk fills up after a number of samples
    struct FullDiskMuxers {
        fail_at: usize,
    }

    struct FullDiskMuxer {
        inner: Box<dyn Muxer>,
        written: usize,
        fail_at: usize,
    }

    impl Muxer for FullDiskMuxer {
        fn name(&self) -> &str {
            "full-disk"
        }

        fn add_track(&mut self, format: &TrackFormat) -> Result<usize, WriterError> {
            self.inner.add_track(format)
        }

        fn start(&mut self) -> Result<(), WriterError> {
            self.inner.start()
        }

        fn write_sample(&mut self, track: usize, sample: &EncodedSample) -> Result<(), WriterError> {
            self.written += 1;
            if self.written >= self.fail_at {
                return Err(WriterError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "no space left on device",
                )));
            }
            self.inner.write_sample(track, sample)
        }

        fn finish(&mut self) -> Result<(), WriterError> {
            self.inner.finish()
        }

        fn abort(&mut self) {
            self.inner.abort();
        }
    }

    impl MuxerFactory for FullDiskMuxers {
        fn open(&self, path: &Path) -> Result<Box<dyn Muxer>, WriterError> {
            Ok(Box::new(FullDiskMuxer {
                inner: Mp4MuxerFactory.open(path)?,
                written: 0,
                fail_at: self.fail_at,
            }))
        }
    }

    struct AdjustableProbe(AtomicU64);

    impl StorageProbe for AdjustableProbe {
        fn available_bytes(&self, _path: &Path) -> Result<u64, ConfigError> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    struct Fixture {
        dir: TempDir,
        controller: PipelineController,
        callback: Arc<RecordingCallback>,
        display: Arc<CountingDisplay>,
        probe: Arc<AdjustableProbe>,
    }

    fn fixture(audio: Arc<dyn AudioCapture>, free_bytes: u64) -> Fixture {
        fixture_with(audio, free_bytes, |caps| caps)
    }

    fn fixture_with(
        audio: Arc<dyn AudioCapture>,
        free_bytes: u64,
        configure: impl FnOnce(Capabilities) -> Capabilities,
    ) -> Fixture {
        let dir = tempdir().unwrap();
        let settings = RecorderSettings {
            output_dir: Some(dir.path().to_path_buf()),
            min_free_bytes: 1_000,
            storage_check_interval_secs: 1,
            poll_timeout_ms: 2,
            drain_timeout_ms: 500,
            ..RecorderSettings::default()
        };
        let display = Arc::new(CountingDisplay::new());
        let probe = Arc::new(AdjustableProbe(AtomicU64::new(free_bytes)));
        let caps = configure(Capabilities::new(display.clone(), audio).with_storage(probe.clone()));
        let callback = Arc::new(RecordingCallback::default());
        let controller = PipelineController::new(settings, caps, callback.clone());
        Fixture {
            dir,
            controller,
            callback,
            display,
            probe,
        }
    }

    fn video_config() -> VideoConfig {
        VideoConfig {
            width: 64,
            height: 32,
            density_dpi: 160,
            rotation: 0,
            frame_rate: 30,
            bitrate: 1_000_000,
            iframe_interval_secs: 1,
            codec: VideoCodec::Raw,
        }
    }

    fn mic() -> AudioConfig {
        AudioConfig::microphone(AudioCodec::Pcm)
    }

    async fn wait_for(controller: &PipelineController, state: PipelineState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.state() != state {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {:?}, in {:?}",
                state,
                controller.state()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// States announced on `events` up to and including `last`
    async fn states_until(
        events: &mut broadcast::Receiver<RecordingEvent>,
        last: PipelineState,
    ) -> Vec<PipelineState> {
        let mut states = Vec::new();
        while states.last() != Some(&last) {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for state change")
                .unwrap();
            if let RecordingEvent::StateChanged { state } = event {
                states.push(state);
            }
        }
        states
    }

    fn trak_with_handler<'a>(data: &'a [u8], handler: &[u8]) -> Option<&'a [u8]> {
        find_all(data, &["moov", "trak"]).into_iter().find(|trak| {
            find(trak, &["mdia", "hdlr"]).map(|hdlr| &hdlr[8..12]) == Some(handler)
        })
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_record_and_stop() {
        let f = fixture(Arc::new(SyntheticAudio::default()), u64::MAX);
        let handle = f.controller.start(Some(video_config()), mic()).await.unwrap();
        assert!(handle.audio_enabled);

        wait_for(&f.controller, PipelineState::Running).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let output = f.controller.stop().await.unwrap();

        assert_eq!(f.controller.state(), PipelineState::Stopped);
        assert_eq!(output.output_path, handle.output_path);
        let name = output.output_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("ScreenRecord-") && name.ends_with(".mp4"));

        let data = std::fs::read(&output.output_path).unwrap();
        assert_eq!(find_all(&data, &["moov", "trak"]).len(), 2);
        assert!(output.container.tracks.iter().all(|t| t.samples > 0));

        let calls = f.callback.calls();
        assert_eq!(calls.first(), Some(&Call::Started));
        assert_eq!(calls.last(), Some(&Call::Stopped(output.output_path.clone())));
        assert!(f.callback.errors().is_empty());
        assert_eq!(f.display.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_audio_disabled_records_single_track() {
        let f = fixture(Arc::new(SyntheticAudio::default()), u64::MAX);
        let handle = f
            .controller
            .start(Some(video_config()), AudioConfig::disabled())
            .await
            .unwrap();
        assert!(!handle.audio_enabled);

        wait_for(&f.controller, PipelineState::Running).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let output = f.controller.stop().await.unwrap();

        let data = std::fs::read(&output.output_path).unwrap();
        assert_eq!(find_all(&data, &["moov", "trak"]).len(), 1);
        assert_eq!(f.callback.stopped(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_immediate_stop_leaves_no_corrupt_file() {
        let f = fixture(Arc::new(SyntheticAudio::default()), u64::MAX);
        let handle = f.controller.start(Some(video_config()), mic()).await.unwrap();

        match f.controller.stop().await {
            Ok(output) => {
                let data = std::fs::read(&output.output_path).unwrap();
                assert!(find(&data, &["moov"]).is_some());
                assert!(f.callback.errors().is_empty());
            }
            Err(_) => {
                assert!(!handle.output_path.exists());
                assert_eq!(f.callback.errors().len(), 1);
                assert_eq!(f.controller.state(), PipelineState::Failed);
            }
        }
        assert_eq!(f.display.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_low_storage_rejects_start() {
        let f = fixture(Arc::new(SyntheticAudio::default()), 10);
        let err = f.controller.start(Some(video_config()), mic()).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::InsufficientStorage { available: 10, .. })
        ));
        assert_eq!(f.controller.state(), PipelineState::Idle);
        assert_eq!(f.display.mirrors.load(Ordering::SeqCst), 0);
        assert!(files_in(f.dir.path()).is_empty());

        let errors = f.callback.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, ErrorKind::Config);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_config_returns_to_idle() {
        let f = fixture(Arc::new(SyntheticAudio::default()), u64::MAX);
        let mut video = video_config();
        video.width = 63;

        assert!(f.controller.start(Some(video), mic()).await.is_err());
        assert_eq!(f.controller.state(), PipelineState::Idle);
        assert_eq!(f.callback.errors().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_encoder_failure_fails_session() {
        let f = fixture(Arc::new(FlakyAudio { fail_after: 10 }), u64::MAX);
        let mut events = f.controller.subscribe();
        let handle = f.controller.start(Some(video_config()), mic()).await.unwrap();

        // A failing session goes straight to Failed
        let states = states_until(&mut events, PipelineState::Failed).await;
        assert!(!states.contains(&PipelineState::Stopping), "{:?}", states);
        assert_eq!(f.controller.state(), PipelineState::Failed);

        assert!(!handle.output_path.exists());
        assert!(files_in(f.dir.path()).is_empty());
        let errors = f.callback.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, ErrorKind::Capture);
        assert!(errors[0].1.contains("device unplugged"));
        assert_eq!(f.callback.stopped(), 0);
        assert_eq!(f.display.releases.load(Ordering::SeqCst), 1);

        // The pipeline accepts a new session afterwards
        assert!(f.controller.session().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_resume_keeps_timestamps_continuous() {
        let f = fixture(Arc::new(SyntheticAudio::default()), u64::MAX);
        f.controller.start(Some(video_config()), mic()).await.unwrap();
        wait_for(&f.controller, PipelineState::Running).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        f.controller.pause().await.unwrap();
        assert_eq!(f.controller.state(), PipelineState::Paused);
        assert!(f.controller.pause().await.is_err());
        tokio::time::sleep(Duration::from_millis(300)).await;

        f.controller.resume().await.unwrap();
        assert_eq!(f.controller.state(), PipelineState::Running);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let output = f.controller.stop().await.unwrap();

        assert_eq!(output.segments.len(), 2);
        assert!(output.total_duration_ms < 450.0);

        // No gap the size of the pause between consecutive video frames
        let data = std::fs::read(&output.output_path).unwrap();
        let video_trak = trak_with_handler(&data, b"vide").unwrap();
        let stts = find(video_trak, &["mdia", "minf", "stbl", "stts"]).unwrap();
        let entries = u32_at(stts, 4) as usize;
        for i in 0..entries {
            let delta = u32_at(stts, 8 + i * 8 + 4);
            assert!(delta < 90_000 / 5, "frame gap of {} ticks", delta);
            // No two frames share the frozen pause instant
            assert!(delta > 0, "repeated frame timestamp");
        }
        assert_eq!(f.display.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_start_rejected() {
        let f = fixture(Arc::new(SyntheticAudio::default()), u64::MAX);
        f.controller.start(Some(video_config()), mic()).await.unwrap();

        let err = f.controller.start(Some(video_config()), mic()).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState(_)));
        assert_eq!(f.display.mirrors.load(Ordering::SeqCst), 1);

        f.controller.stop().await.ok();
        assert!(f.controller.state().is_quiescent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_without_session_rejected() {
        let f = fixture(Arc::new(SyntheticAudio::default()), u64::MAX);
        assert!(matches!(
            f.controller.stop().await,
            Err(PipelineError::InvalidState(PipelineState::Idle))
        ));
        assert!(f.controller.resume().await.is_err());
        assert!(f.callback.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abort_deletes_output() {
        let f = fixture(Arc::new(SyntheticAudio::default()), u64::MAX);
        let handle = f.controller.start(Some(video_config()), mic()).await.unwrap();
        wait_for(&f.controller, PipelineState::Running).await;

        f.controller.abort("display turned off").await.unwrap();

        assert_eq!(f.controller.state(), PipelineState::Failed);
        assert!(!handle.output_path.exists());
        let errors = f.callback.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, ErrorKind::Capture);
        assert_eq!(f.display.releases.load(Ordering::SeqCst), 1);
        assert!(f.controller.abort("again").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_low_storage_mid_session_stops_and_keeps_file() {
        let f = fixture(Arc::new(SyntheticAudio::default()), u64::MAX);
        let mut events = f.controller.subscribe();
        let handle = f.controller.start(Some(video_config()), mic()).await.unwrap();
        wait_for(&f.controller, PipelineState::Running).await;

        f.probe.0.store(10, Ordering::SeqCst);
        wait_for(&f.controller, PipelineState::Stopped).await;

        assert!(handle.output_path.exists());
        assert_eq!(f.callback.stopped(), 1);

        let mut saw_storage_low = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RecordingEvent::StorageLow { available: 10, .. }) {
                saw_storage_low = true;
            }
        }
        assert!(saw_storage_low);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_audio_captured_while_paused_is_not_recorded() {
        let f = fixture(Arc::new(CallbackAudio), u64::MAX);
        f.controller.start(Some(video_config()), mic()).await.unwrap();
        wait_for(&f.controller, PipelineState::Running).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        f.controller.pause().await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        f.controller.resume().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let output = f.controller.stop().await.unwrap();

        // Every buffer covers 10 ms; buffers from the pause would outnumber
        // the recorded timeline
        let audio = output
            .container
            .tracks
            .iter()
            .find(|t| t.kind == Some(StreamKind::Audio))
            .unwrap();
        let span_us = audio.last_pts_us - audio.first_pts_us.unwrap();
        assert!(
            audio.samples * 10_000 <= span_us + 100_000,
            "{} buffers in {} us of audio",
            audio.samples,
            span_us
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_audio_only_session() {
        let f = fixture(Arc::new(SyntheticAudio::default()), u64::MAX);
        let handle = f.controller.start(None, mic()).await.unwrap();
        assert!(!handle.video_enabled);
        assert!(handle.audio_enabled);

        wait_for(&f.controller, PipelineState::Running).await;
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        let output = f.controller.stop().await.unwrap();

        let data = std::fs::read(&output.output_path).unwrap();
        assert_eq!(find_all(&data, &["moov", "trak"]).len(), 1);
        assert!(trak_with_handler(&data, b"soun").is_some());
        assert_eq!(f.display.mirrors.load(Ordering::SeqCst), 0);
        assert_eq!(f.display.releases.load(Ordering::SeqCst), 0);

        // Progress comes from the audio track
        let calls = f.callback.calls();
        assert_eq!(calls.first(), Some(&Call::Started));
        assert!(calls.iter().any(|c| matches!(c, Call::Progress(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_nothing_to_record_is_rejected() {
        let f = fixture(Arc::new(SyntheticAudio::default()), u64::MAX);
        let err = f.controller.start(None, AudioConfig::disabled()).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::InvalidParameter(_))
        ));
        assert_eq!(f.controller.state(), PipelineState::Idle);
        assert!(files_in(f.dir.path()).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_failure_fails_session() {
        let f = fixture_with(Arc::new(SyntheticAudio::default()), u64::MAX, |caps| {
            caps.with_muxers(Arc::new(FullDiskMuxers { fail_at: 20 }))
        });
        let handle = f.controller.start(Some(video_config()), mic()).await.unwrap();

        wait_for(&f.controller, PipelineState::Failed).await;

        assert!(!handle.output_path.exists());
        assert!(files_in(f.dir.path()).is_empty());
        let errors = f.callback.errors();
        assert_eq!(errors.len(), 1, "{:?}", errors);
        assert_eq!(errors[0].0, ErrorKind::Writer);
        assert!(errors[0].1.contains("no space left on device"));
        assert_eq!(f.callback.stopped(), 0);
        assert_eq!(f.display.releases.load(Ordering::SeqCst), 1);
        assert!(f.controller.session().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_progress_waits_for_started() {
        let f = fixture(Arc::new(SyntheticAudio::default()), u64::MAX);
        f.controller.shared.set_state(PipelineState::Starting);
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(SupervisorEvent::FirstSample(StreamKind::Video)).unwrap();
        tx.send(SupervisorEvent::Progress(1_000_000)).unwrap();
        tx.send(SupervisorEvent::FirstSample(StreamKind::Audio)).unwrap();
        tx.send(SupervisorEvent::Progress(2_000_000)).unwrap();
        drop(tx);
        supervise(
            f.controller.clone(),
            Uuid::new_v4(),
            vec![StreamKind::Video, StreamKind::Audio],
            rx,
        )
        .await;

        assert_eq!(f.controller.state(), PipelineState::Running);
        assert_eq!(
            f.callback.calls(),
            vec![Call::Started, Call::Progress(2_000_000)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_ended_returns_after_failure() {
        let f = fixture(Arc::new(FlakyAudio { fail_after: 10 }), u64::MAX);
        let mut events = f.controller.subscribe();
        f.controller.start(Some(video_config()), mic()).await.unwrap();

        let state = tokio::time::timeout(Duration::from_secs(5), f.controller.wait_ended(&mut events))
            .await
            .unwrap();
        assert_eq!(state, PipelineState::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_ended_returns_after_storage_stop() {
        let f = fixture(Arc::new(SyntheticAudio::default()), u64::MAX);
        let mut events = f.controller.subscribe();
        f.controller.start(Some(video_config()), mic()).await.unwrap();
        wait_for(&f.controller, PipelineState::Running).await;

        f.probe.0.store(10, Ordering::SeqCst);
        let state = tokio::time::timeout(Duration::from_secs(5), f.controller.wait_ended(&mut events))
            .await
            .unwrap();
        assert_eq!(state, PipelineState::Stopped);
        assert_eq!(f.callback.stopped(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_configs_follow_settings() {
        let f = fixture(Arc::new(SyntheticAudio::default()), u64::MAX);
        let (video, audio) = f.controller.session_configs().await.unwrap();

        // Only the software fallback is available
        assert_eq!(video.codec, VideoCodec::Raw);
        assert_eq!((video.width, video.height), (64, 32));
        assert!(!audio.is_enabled());
    }
}
