//! Audio capture using cpal
//!
//! Microphone capture builds an input stream on an input device. Internal
//! playback capture builds an input stream on the default output device,
//! which the WASAPI backend serves as loopback.

use super::clock::SessionClock;
use super::traits::{AudioCapture, AudioDeviceInfo, CaptureSource, PauseStrategy};
use crate::encoder::{RawChunk, StreamKind};
use crate::recorder::config::{AudioConfig, AudioSource};
use crate::utils::error::{CaptureError, ConfigError};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Buffered callbacks before incoming audio is dropped
const CHANNEL_DEPTH: usize = 64;

type PcmMessage = Result<RawChunk, String>;

/// Bounded queue between a capture callback and the encoder thread
pub fn pcm_queue(clock: SessionClock) -> (PcmProducer, PcmConsumer) {
    let (sender, receiver) = mpsc::sync_channel(CHANNEL_DEPTH);
    let capturing = Arc::new(AtomicBool::new(true));
    (
        PcmProducer {
            sender,
            clock,
            capturing: capturing.clone(),
        },
        PcmConsumer {
            receiver,
            capturing,
        },
    )
}

/// Callback side of a PCM queue. Buffers arriving while the session clock is
/// paused, or while the consumer is suspended, are discarded.
#[derive(Clone)]
pub struct PcmProducer {
    sender: SyncSender<PcmMessage>,
    clock: SessionClock,
    capturing: Arc<AtomicBool>,
}

impl PcmProducer {
    /// Stamp and enqueue one buffer of interleaved 16-bit PCM
    pub fn push_pcm(&self, data: Vec<u8>) {
        if !self.capturing.load(Ordering::SeqCst) {
            return;
        }
        if let Some(pts_us) = self.clock.running_now_us() {
            self.push(Ok(RawChunk { data, pts_us }));
        }
    }

    pub fn push_error(&self, reason: String) {
        self.push(Err(reason));
    }

    fn push(&self, message: PcmMessage) {
        if let Err(TrySendError::Full(_)) = self.sender.try_send(message) {
            tracing::warn!("Audio capture backlog full, dropping a buffer");
        }
    }
}

/// Encoder side of a PCM queue
pub struct PcmConsumer {
    receiver: Receiver<PcmMessage>,
    capturing: Arc<AtomicBool>,
}

impl PcmConsumer {
    pub fn read(&mut self, timeout: Duration) -> Result<Option<RawChunk>, CaptureError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(Ok(chunk)) => Ok(Some(chunk)),
            Ok(Err(reason)) => Err(CaptureError::SourceLost {
                kind: StreamKind::Audio,
                reason,
            }),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::SourceLost {
                kind: StreamKind::Audio,
                reason: "audio stream closed".to_string(),
            }),
        }
    }

    /// Stop accepting buffers. Anything already queued was captured before
    /// the pause and is still read after `resume`.
    pub fn suspend(&self) {
        self.capturing.store(false, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.capturing.store(true, Ordering::SeqCst);
    }
}

/// List available audio input devices
pub fn get_audio_input_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .and_then(|d| d.name().ok());

    let devices = match host.input_devices() {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("Failed to enumerate input devices: {}", e);
            return Vec::new();
        }
    };

    devices
        .filter_map(|device| device.name().ok())
        .map(|name| AudioDeviceInfo {
            id: name.clone(),
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            is_input: true,
        })
        .collect()
}

fn find_device(config: &AudioConfig) -> Result<Device, ConfigError> {
    let host = cpal::default_host();
    match config.source {
        AudioSource::Microphone => match &config.device {
            Some(wanted) => host
                .input_devices()
                .map_err(|e| ConfigError::SourceUnavailable(e.to_string()))?
                .find(|d| d.name().map(|n| &n == wanted).unwrap_or(false))
                .ok_or_else(|| {
                    ConfigError::SourceUnavailable(format!("input device '{}' not found", wanted))
                }),
            None => host.default_input_device().ok_or_else(|| {
                ConfigError::SourceUnavailable("no default input device".to_string())
            }),
        },
        AudioSource::Internal => host.default_output_device().ok_or_else(|| {
            ConfigError::SourceUnavailable("no default output device for loopback".to_string())
        }),
        AudioSource::Disabled => Err(ConfigError::InvalidParameter(
            "audio capture is disabled".to_string(),
        )),
    }
}

/// cpal-backed audio capture capability
#[derive(Debug, Default)]
pub struct CpalAudio;

impl CpalAudio {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioCapture for CpalAudio {
    fn name(&self) -> &str {
        "cpal"
    }

    fn pause_strategy(&self) -> PauseStrategy {
        // The device keeps delivering callbacks while paused
        PauseStrategy::ReleaseAndReacquire
    }

    async fn open(
        &self,
        config: &AudioConfig,
        clock: SessionClock,
    ) -> Result<Box<dyn CaptureSource>, ConfigError> {
        let source = CpalSource::open(config.clone(), clock)?;
        Ok(Box::new(source))
    }
}

/// PCM source fed by a cpal stream living on its own thread
pub struct CpalSource {
    queue: PcmConsumer,
    running: Arc<AtomicBool>,
    stream_thread: Option<JoinHandle<()>>,
}

impl CpalSource {
    pub fn open(config: AudioConfig, clock: SessionClock) -> Result<Self, ConfigError> {
        let (producer, queue) = pcm_queue(clock);
        let (ready_tx, ready_rx) = mpsc::channel::<Result<String, ConfigError>>();
        let running = Arc::new(AtomicBool::new(true));

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // cpal streams are not Send on every platform, so the device is opened
        // and the stream kept alive on a dedicated thread.
        let thread_running = running.clone();
        let thread_config = config.clone();
        let stream_thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = match open_stream(&thread_config, &stream_config, producer) {
                    Ok((stream, device_name)) => {
                        let _ = ready_tx.send(Ok(device_name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while thread_running.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(20));
                }
                drop(stream);
                tracing::debug!("Audio capture stream closed");
            })?;

        let device_name = match ready_rx.recv() {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                let _ = stream_thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = stream_thread.join();
                return Err(ConfigError::SourceUnavailable(
                    "audio capture thread exited".to_string(),
                ));
            }
        };

        tracing::info!(
            "Audio capture opened on {} ({}Hz, {}ch, {:?})",
            device_name,
            config.sample_rate,
            config.channels,
            config.source
        );

        Ok(Self {
            queue,
            running,
            stream_thread: Some(stream_thread),
        })
    }
}

fn open_stream(
    config: &AudioConfig,
    stream_config: &StreamConfig,
    producer: PcmProducer,
) -> Result<(cpal::Stream, String), ConfigError> {
    let device = find_device(config)?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let sample_format = match config.source {
        AudioSource::Internal => device.default_output_config(),
        _ => device.default_input_config(),
    }
    .map_err(|e| ConfigError::Unsupported(format!("audio config for {}: {}", device_name, e)))?
    .sample_format();

    let stream = build_stream(&device, stream_config, sample_format, producer)
        .map_err(ConfigError::Unsupported)?;
    stream
        .play()
        .map_err(|e| ConfigError::SourceUnavailable(format!("failed to start stream: {}", e)))?;

    Ok((stream, device_name))
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    producer: PcmProducer,
) -> Result<cpal::Stream, String> {
    let error_producer = producer.clone();
    let on_error = move |err: cpal::StreamError| {
        tracing::error!("Audio stream error: {}", err);
        error_producer.push_error(err.to_string());
    };

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let bytes: Vec<u8> = data
                    .iter()
                    .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                    .flat_map(|s| s.to_le_bytes())
                    .collect();
                producer.push_pcm(bytes);
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let bytes: Vec<u8> = data.iter().flat_map(|s| s.to_le_bytes()).collect();
                producer.push_pcm(bytes);
            },
            on_error,
            None,
        ),
        other => return Err(format!("unsupported sample format {:?}", other)),
    };

    stream.map_err(|e| format!("failed to build input stream: {}", e))
}

impl CaptureSource for CpalSource {
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
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.release();
    }
}
