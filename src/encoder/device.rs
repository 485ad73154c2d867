//! Encoder device contract
//!
//! Hardware and software codecs are opaque to the pipeline. A device accepts
//! raw input, and hands back, in order: one format change, an optional codec
//! configuration buffer, encoded samples, and finally a buffer flagged
//! end-of-stream once input has been closed.

use super::types::{EncodedSample, RawChunk, SampleFlags, TrackFormat, TrackParams};
use crate::recorder::config::{AudioCodec, CaptureConfig, VideoCaps, VideoCodec};
use crate::utils::error::{CaptureError, ConfigError};
use std::collections::VecDeque;
use std::time::Duration;

/// Result of polling a device for output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderOutput {
    /// Nothing available within the timeout
    TryAgainLater,
    /// The device negotiated its output format
    FormatChanged(TrackFormat),
    Sample(EncodedSample),
}

/// An opaque encoder instance
pub trait EncoderDevice: Send {
    fn name(&self) -> &str;

    fn queue_input(&mut self, chunk: RawChunk) -> Result<(), CaptureError>;

    /// Close the input side; the device answers with an end-of-stream buffer
    fn signal_end_of_input(&mut self, pts_us: u64) -> Result<(), CaptureError>;

    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput, CaptureError>;

    /// Free the device. Called exactly once by the owning encoder.
    fn release(&mut self);
}

/// Source of encoder devices and their capabilities
pub trait CodecRegistry: Send + Sync {
    /// Limits for `codec`, or `None` if no encoder exists for it
    fn video_caps(&self, codec: VideoCodec) -> Option<VideoCaps>;

    fn supports_audio(&self, codec: AudioCodec) -> bool;

    /// Open and configure an encoder for `config`
    fn create_encoder(&self, config: &CaptureConfig) -> Result<Box<dyn EncoderDevice>, ConfigError>;
}

/// First video codec in `preferences` the registry can encode
pub fn best_video_codec(registry: &dyn CodecRegistry, preferences: &[VideoCodec]) -> Option<VideoCodec> {
    let codec = preferences
        .iter()
        .copied()
        .find(|codec| registry.video_caps(*codec).is_some());
    tracing::debug!("Selected video codec {:?} from {:?}", codec, preferences);
    codec
}

/// First audio codec in `preferences` the registry can encode
pub fn best_audio_codec(registry: &dyn CodecRegistry, preferences: &[AudioCodec]) -> Option<AudioCodec> {
    preferences
        .iter()
        .copied()
        .find(|codec| registry.supports_audio(*codec))
}

/// Software registry providing passthrough encoders for raw video and PCM.
///
/// Compressed codecs come from platform registries.
#[derive(Debug, Clone)]
pub struct SoftwareCodecs {
    raw_caps: VideoCaps,
}

impl SoftwareCodecs {
    pub fn new() -> Self {
        Self {
            raw_caps: VideoCaps {
                max_width: 3840,
                max_height: 2160,
                max_bitrate: u32::MAX,
            },
        }
    }
}

impl Default for SoftwareCodecs {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry for SoftwareCodecs {
    fn video_caps(&self, codec: VideoCodec) -> Option<VideoCaps> {
        match codec {
            VideoCodec::Raw => Some(self.raw_caps),
            VideoCodec::Hevc | VideoCodec::Avc => None,
        }
    }

    fn supports_audio(&self, codec: AudioCodec) -> bool {
        codec == AudioCodec::Pcm
    }

    fn create_encoder(&self, config: &CaptureConfig) -> Result<Box<dyn EncoderDevice>, ConfigError> {
        config.validate()?;
        match config {
            CaptureConfig::Video(video) => {
                let caps = self.video_caps(video.codec).ok_or_else(|| {
                    ConfigError::Unsupported(format!("no encoder for {}", video.codec.mime()))
                })?;
                let (long, short) = (video.width.max(video.height), video.width.min(video.height));
                if long > caps.max_width.max(caps.max_height) || short > caps.max_width.min(caps.max_height) {
                    return Err(ConfigError::Unsupported(format!(
                        "{}x{} exceeds {}x{}",
                        video.width, video.height, caps.max_width, caps.max_height
                    )));
                }
                let format = TrackFormat {
                    mime: video.codec.mime().to_string(),
                    params: TrackParams::Video {
                        width: video.width,
                        height: video.height,
                        frame_rate: video.frame_rate,
                        rotation: video.rotation,
                    },
                    codec_config: Vec::new(),
                    bitrate: video.bitrate,
                };
                Ok(Box::new(PassthroughEncoder::new("sw.raw.video", format)))
            }
            CaptureConfig::Audio(audio) => {
                if !audio.is_enabled() {
                    return Err(ConfigError::InvalidParameter(
                        "audio encoder requested for disabled source".to_string(),
                    ));
                }
                if !self.supports_audio(audio.codec) {
                    return Err(ConfigError::Unsupported(format!(
                        "no encoder for {}",
                        audio.codec.mime()
                    )));
                }
                let format = TrackFormat {
                    mime: audio.codec.mime().to_string(),
                    params: TrackParams::Audio {
                        sample_rate: audio.sample_rate,
                        channels: audio.channels,
                        bits_per_sample: 16,
                    },
                    codec_config: Vec::new(),
                    bitrate: u32::from(audio.channels) * 16 * audio.sample_rate,
                };
                Ok(Box::new(PassthroughEncoder::new("sw.pcm", format)))
            }
        }
    }
}

/// Device that emits its input unchanged, every sample a sync sample
pub struct PassthroughEncoder {
    name: String,
    format: TrackFormat,
    pending: VecDeque<EncodedSample>,
    format_sent: bool,
    config_sent: bool,
    input_closed: Option<u64>,
    eos_sent: bool,
    last_pts: u64,
    released: bool,
}

impl PassthroughEncoder {
    pub fn new(name: &str, format: TrackFormat) -> Self {
        Self {
            name: name.to_string(),
            format,
            pending: VecDeque::new(),
            format_sent: false,
            config_sent: false,
            input_closed: None,
            eos_sent: false,
            last_pts: 0,
            released: false,
        }
    }

    fn failure(&self, reason: &str) -> CaptureError {
        CaptureError::Encoder {
            kind: self.format.kind(),
            reason: format!("{}: {}", self.name, reason),
        }
    }
}

impl EncoderDevice for PassthroughEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue_input(&mut self, chunk: RawChunk) -> Result<(), CaptureError> {
        if self.released {
            return Err(self.failure("device released"));
        }
        if self.input_closed.is_some() {
            return Err(self.failure("input queued after end of stream"));
        }
        self.last_pts = self.last_pts.max(chunk.pts_us);
        self.pending
            .push_back(EncodedSample::new(chunk.data, chunk.pts_us, SampleFlags::KEY_FRAME));
        Ok(())
    }

    fn signal_end_of_input(&mut self, pts_us: u64) -> Result<(), CaptureError> {
        if self.released {
            return Err(self.failure("device released"));
        }
        self.input_closed.get_or_insert(pts_us);
        Ok(())
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput, CaptureError> {
        if self.released {
            return Err(self.failure("device released"));
        }

        if !self.pending.is_empty() {
            if !self.format_sent {
                self.format_sent = true;
                return Ok(EncoderOutput::FormatChanged(self.format.clone()));
            }
            if !self.config_sent {
                self.config_sent = true;
                if !self.format.codec_config.is_empty() {
                    let pts = self.pending.front().map(|s| s.pts_us).unwrap_or(0);
                    return Ok(EncoderOutput::Sample(EncodedSample::new(
                        self.format.codec_config.clone(),
                        pts,
                        SampleFlags::CODEC_CONFIG,
                    )));
                }
            }
            if let Some(sample) = self.pending.pop_front() {
                return Ok(EncoderOutput::Sample(sample));
            }
        }

        if let Some(end_pts) = self.input_closed {
            if !self.eos_sent {
                self.eos_sent = true;
                return Ok(EncoderOutput::Sample(EncodedSample::end_of_stream(
                    end_pts.max(self.last_pts),
                )));
            }
        }

        if !timeout.is_zero() {
            std::thread::sleep(timeout);
        }
        Ok(EncoderOutput::TryAgainLater)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.pending.clear();
            tracing::debug!("Encoder device {} released", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::config::{AudioConfig, VideoConfig};

    fn raw_video(width: u32, height: u32) -> CaptureConfig {
        CaptureConfig::Video(VideoConfig {
            width,
            height,
            density_dpi: 160,
            rotation: 0,
            frame_rate: 30,
            bitrate: 1_000_000,
            iframe_interval_secs: 1,
            codec: VideoCodec::Raw,
        })
    }

    fn chunk(pts_us: u64) -> RawChunk {
        RawChunk {
            data: vec![1, 2, 3, 4],
            pts_us,
        }
    }

    #[test]
    fn test_best_codec_walks_preferences() {
        let codecs = SoftwareCodecs::new();
        let preferred = [VideoCodec::Hevc, VideoCodec::Avc, VideoCodec::Raw];
        assert_eq!(best_video_codec(&codecs, &preferred), Some(VideoCodec::Raw));
        assert_eq!(best_video_codec(&codecs, &[VideoCodec::Hevc]), None);
        assert_eq!(
            best_audio_codec(&codecs, &[AudioCodec::Aac, AudioCodec::Pcm]),
            Some(AudioCodec::Pcm)
        );
    }

    #[test]
    fn test_unsupported_codec_and_size() {
        let codecs = SoftwareCodecs::new();

        let mut avc = raw_video(1280, 720);
        if let CaptureConfig::Video(video) = &mut avc {
            video.codec = VideoCodec::Avc;
        }
        assert!(matches!(codecs.create_encoder(&avc), Err(ConfigError::Unsupported(_))));
        assert!(matches!(
            codecs.create_encoder(&raw_video(7680, 4320)),
            Err(ConfigError::Unsupported(_))
        ));
        assert!(matches!(
            codecs.create_encoder(&CaptureConfig::Audio(AudioConfig::disabled())),
            Err(ConfigError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_passthrough_output_order() {
        let codecs = SoftwareCodecs::new();
        let mut device = codecs.create_encoder(&raw_video(64, 32)).unwrap();

        assert_eq!(
            device.dequeue_output(Duration::ZERO).unwrap(),
            EncoderOutput::TryAgainLater
        );

        device.queue_input(chunk(100)).unwrap();
        device.queue_input(chunk(200)).unwrap();
        device.signal_end_of_input(250).unwrap();

        assert!(matches!(
            device.dequeue_output(Duration::ZERO).unwrap(),
            EncoderOutput::FormatChanged(_)
        ));
        let mut timestamps = Vec::new();
        loop {
            match device.dequeue_output(Duration::ZERO).unwrap() {
                EncoderOutput::Sample(sample) if sample.is_end_of_stream() => {
                    assert_eq!(sample.pts_us, 250);
                    break;
                }
                EncoderOutput::Sample(sample) => {
                    assert!(sample.flags.key_frame);
                    timestamps.push(sample.pts_us);
                }
                other => panic!("unexpected output {:?}", other),
            }
        }
        assert_eq!(timestamps, vec![100, 200]);
        assert!(device.queue_input(chunk(300)).is_err());
    }

    #[test]
    fn test_end_of_stream_without_input_has_no_format() {
        let codecs = SoftwareCodecs::new();
        let mut device = codecs
            .create_encoder(&CaptureConfig::Audio(AudioConfig::microphone(AudioCodec::Pcm)))
            .unwrap();
        device.signal_end_of_input(0).unwrap();
        match device.dequeue_output(Duration::ZERO).unwrap() {
            EncoderOutput::Sample(sample) => assert!(sample.is_end_of_stream()),
            other => panic!("unexpected output {:?}", other),
        }
        device.release();
        assert!(device.dequeue_output(Duration::ZERO).is_err());
    }
}
