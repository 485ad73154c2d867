//! Capture capabilities
//!
//! Display mirroring and audio capture sources, plus the session clock that
//! stamps everything they produce.

pub mod audio;
pub mod clock;
pub mod synthetic;
pub mod traits;

pub use audio::{get_audio_input_devices, pcm_queue, CpalAudio, PcmConsumer, PcmProducer};
pub use clock::SessionClock;
pub use synthetic::{SyntheticAudio, SyntheticDisplay};
pub use traits::{
    AudioCapture, AudioDeviceInfo, CaptureSource, DisplayCapture, DisplayInfo, PauseStrategy,
};
