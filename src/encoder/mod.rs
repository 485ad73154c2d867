//! Stream encoding
//!
//! Encoder device contract, codec selection and the per-stream drain loop.

pub mod device;
pub mod stream;
pub mod types;

pub use device::{
    best_audio_codec, best_video_codec, CodecRegistry, EncoderDevice, EncoderOutput,
    PassthroughEncoder, SoftwareCodecs,
};
pub use stream::{EncoderControl, StreamEncoder, StreamEnd, StreamSink, StreamSummary};
pub use types::{
    EncodedSample, RawChunk, SampleFlags, StreamEvent, StreamKind, TrackFormat, TrackHandle,
    TrackParams,
};
