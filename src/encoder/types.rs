//! Encoded stream data types
//!
//! Samples, formats and track handles exchanged between encoders and the
//! container writer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which of the two session streams a component belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Video => f.write_str("video"),
            StreamKind::Audio => f.write_str("audio"),
        }
    }
}

/// Per-sample flags reported by the encoder device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFlags {
    /// Sync sample (decodable without earlier samples)
    pub key_frame: bool,
    /// Codec configuration payload, already carried by the track format
    pub codec_config: bool,
    /// Last buffer the device will emit
    pub end_of_stream: bool,
}

impl SampleFlags {
    pub const KEY_FRAME: SampleFlags = SampleFlags {
        key_frame: true,
        codec_config: false,
        end_of_stream: false,
    };

    pub const CODEC_CONFIG: SampleFlags = SampleFlags {
        key_frame: false,
        codec_config: true,
        end_of_stream: false,
    };

    pub const END_OF_STREAM: SampleFlags = SampleFlags {
        key_frame: false,
        codec_config: false,
        end_of_stream: true,
    };
}

/// One compressed access unit.
///
/// Owned by the producing encoder until handed to the container writer, which
/// copies it out; nothing retains it after the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSample {
    pub data: Vec<u8>,
    /// Presentation timestamp in microseconds on the session clock
    pub pts_us: u64,
    pub flags: SampleFlags,
}

impl EncodedSample {
    pub fn new(data: Vec<u8>, pts_us: u64, flags: SampleFlags) -> Self {
        Self { data, pts_us, flags }
    }

    /// Empty buffer carrying only the end-of-stream flag
    pub fn end_of_stream(pts_us: u64) -> Self {
        Self::new(Vec::new(), pts_us, SampleFlags::END_OF_STREAM)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.end_of_stream
    }
}

/// Raw captured input: one frame or one PCM chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub data: Vec<u8>,
    pub pts_us: u64,
}

/// Stream parameters negotiated by the encoder device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum TrackParams {
    Video {
        width: u32,
        height: u32,
        frame_rate: u32,
        /// Orientation hint in degrees (0, 90, 180, 270)
        rotation: u16,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
        bits_per_sample: u16,
    },
}

/// Output format reported once per stream when the encoder starts producing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackFormat {
    /// MIME type, e.g. `video/avc`, `audio/mp4a-latm`, `audio/raw`
    pub mime: String,
    pub params: TrackParams,
    /// Codec specific data (avcC/hvcC record, AudioSpecificConfig)
    #[serde(default)]
    pub codec_config: Vec<u8>,
    /// Target bitrate in bits per second, if known
    #[serde(default)]
    pub bitrate: u32,
}

impl TrackFormat {
    pub fn kind(&self) -> StreamKind {
        match self.params {
            TrackParams::Video { .. } => StreamKind::Video,
            TrackParams::Audio { .. } => StreamKind::Audio,
        }
    }
}

/// Identifier assigned by the container writer on track registration.
///
/// A stream without a handle has simply not reported its format yet; there is
/// no sentinel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackHandle(pub(crate) usize);

impl TrackHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TrackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

/// Messages an encoder emits, in protocol order: one `Format`, any number of
/// `Sample`s, then `End`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Format(TrackFormat),
    Sample(EncodedSample),
    End,
}
