//! Synthetic capture backends
//!
//! A moving test pattern stands in for the mirrored display and a sine tone
//! for the audio device. Both are paced in real time against the session
//! clock, so they behave like live sources.

use super::clock::SessionClock;
use super::traits::{
    AudioCapture, CaptureSource, DisplayCapture, DisplayInfo, PauseStrategy,
};
use crate::encoder::{RawChunk, StreamKind};
use crate::recorder::config::{AudioConfig, VideoConfig};
use crate::utils::error::{CaptureError, ConfigError};
use async_trait::async_trait;
use std::f32::consts::PI;
use std::time::{Duration, Instant};

/// PCM frames per audio chunk
pub const SAMPLES_PER_CHUNK: usize = 1024;

/// Emits ticks at a fixed interval, waiting at most the caller's timeout
struct Pacer {
    interval: Duration,
    next: Instant,
}

impl Pacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// True if a tick is due within `timeout`; sleeps until then.
    fn wait(&mut self, timeout: Duration) -> bool {
        let now = Instant::now();
        if self.next > now {
            let remaining = self.next - now;
            if remaining > timeout {
                std::thread::sleep(timeout);
                return false;
            }
            std::thread::sleep(remaining);
        }
        self.next += self.interval;
        // Don't burst to catch up after a long stall
        if self.next < Instant::now() {
            self.next = Instant::now() + self.interval;
        }
        true
    }

    fn reset(&mut self) {
        self.next = Instant::now();
    }
}

/// Test-pattern display backend
pub struct SyntheticDisplay {
    display: DisplayInfo,
    pause_strategy: PauseStrategy,
}

impl SyntheticDisplay {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            display: DisplayInfo {
                id: 0,
                name: "Synthetic Display".to_string(),
                width,
                height,
                scale_factor: 1.0,
                density_dpi: 160,
                rotation: 0,
                is_primary: true,
                refresh_rate: Some(60),
            },
            pause_strategy: PauseStrategy::IdleInPlace,
        }
    }

    pub fn with_pause_strategy(mut self, strategy: PauseStrategy) -> Self {
        self.pause_strategy = strategy;
        self
    }
}

#[async_trait]
impl DisplayCapture for SyntheticDisplay {
    fn name(&self) -> &str {
        "synthetic-display"
    }

    fn pause_strategy(&self) -> PauseStrategy {
        self.pause_strategy
    }

    async fn default_display(&self) -> Result<DisplayInfo, ConfigError> {
        Ok(self.display.clone())
    }

    async fn mirror(
        &self,
        config: &VideoConfig,
        clock: SessionClock,
    ) -> Result<Box<dyn CaptureSource>, ConfigError> {
        tracing::info!(
            "Mirroring synthetic display at {}x{} ({} dpi) @ {}fps",
            config.width,
            config.height,
            config.density_dpi,
            config.frame_rate
        );
        Ok(Box::new(TestPatternSource::new(config, clock)))
    }

    fn release(&self) {
        tracing::debug!("Synthetic display session released");
    }
}

/// Frame producer drawing a bar that sweeps across the screen
pub struct TestPatternSource {
    width: usize,
    height: usize,
    clock: SessionClock,
    pacer: Pacer,
    frame_index: u64,
    active: bool,
    released: bool,
}

impl TestPatternSource {
    pub fn new(config: &VideoConfig, clock: SessionClock) -> Self {
        Self {
            width: config.width as usize,
            height: config.height as usize,
            clock,
            pacer: Pacer::new(config.frame_interval()),
            frame_index: 0,
            active: true,
            released: false,
        }
    }

    /// One ARGB frame
    fn render(&self) -> Vec<u8> {
        let mut frame = vec![0u8; self.width * self.height * 4];
        let bar_width = (self.width / 16).max(1);
        let bar_x = (self.frame_index as usize * 4) % self.width.max(1);
        for row in frame.chunks_exact_mut(self.width * 4) {
            for (x, pixel) in row.chunks_exact_mut(4).enumerate() {
                let lit = x >= bar_x && x < bar_x + bar_width;
                let shade = if lit { 0xff } else { (x * 255 / self.width.max(1)) as u8 / 4 };
                pixel.copy_from_slice(&[0xff, shade, shade, shade]);
            }
        }
        frame
    }
}

impl CaptureSource for TestPatternSource {
    fn kind(&self) -> StreamKind {
        StreamKind::Video
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<RawChunk>, CaptureError> {
        if self.released || !self.active {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        if !self.pacer.wait(timeout) {
            return Ok(None);
        }
        let data = self.render();
        self.frame_index += 1;
        Ok(Some(RawChunk {
            data,
            pts_us: self.clock.now_us(),
        }))
    }

    fn suspend(&mut self) -> Result<(), CaptureError> {
        tracing::debug!("Test pattern suspended");
        self.active = false;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), CaptureError> {
        tracing::debug!("Test pattern resumed");
        self.active = true;
        self.pacer.reset();
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            tracing::debug!("Test pattern released after {} frames", self.frame_index);
        }
    }
}

/// Sine-tone audio backend
pub struct SyntheticAudio {
    frequency: f32,
}

impl SyntheticAudio {
    pub fn new(frequency: f32) -> Self {
        Self { frequency }
    }
}

impl Default for SyntheticAudio {
    fn default() -> Self {
        Self::new(440.0)
    }
}

#[async_trait]
impl AudioCapture for SyntheticAudio {
    fn name(&self) -> &str {
        "synthetic-audio"
    }

    async fn open(
        &self,
        config: &AudioConfig,
        clock: SessionClock,
    ) -> Result<Box<dyn CaptureSource>, ConfigError> {
        Ok(Box::new(ToneSource::new(config, self.frequency, clock)))
    }
}

/// PCM producer generating a continuous sine wave
pub struct ToneSource {
    sample_rate: u32,
    channels: usize,
    frequency: f32,
    phase: f32,
    clock: SessionClock,
    pacer: Pacer,
    released: bool,
}

impl ToneSource {
    pub fn new(config: &AudioConfig, frequency: f32, clock: SessionClock) -> Self {
        let chunk_us = SAMPLES_PER_CHUNK as u64 * 1_000_000 / u64::from(config.sample_rate.max(1));
        Self {
            sample_rate: config.sample_rate,
            channels: usize::from(config.channels),
            frequency,
            phase: 0.0,
            clock,
            pacer: Pacer::new(Duration::from_micros(chunk_us)),
            released: false,
        }
    }

    fn render(&mut self) -> Vec<u8> {
        let step = 2.0 * PI * self.frequency / self.sample_rate as f32;
        let mut out = Vec::with_capacity(SAMPLES_PER_CHUNK * self.channels * 2);
        for _ in 0..SAMPLES_PER_CHUNK {
            let value = (self.phase.sin() * 0.25 * i16::MAX as f32) as i16;
            for _ in 0..self.channels {
                out.extend_from_slice(&value.to_le_bytes());
            }
            self.phase = (self.phase + step) % (2.0 * PI);
        }
        out
    }
}

impl CaptureSource for ToneSource {
    fn kind(&self) -> StreamKind {
        StreamKind::Audio
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<RawChunk>, CaptureError> {
        if self.released {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        if !self.pacer.wait(timeout) {
            return Ok(None);
        }
        let pts_us = self.clock.now_us();
        Ok(Some(RawChunk {
            data: self.render(),
            pts_us,
        }))
    }

    fn resume(&mut self) -> Result<(), CaptureError> {
        self.pacer.reset();
        Ok(())
    }

    fn release(&mut self) {
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::config::{AudioCodec, VideoCodec};

    fn small_video() -> VideoConfig {
        VideoConfig {
            width: 32,
            height: 16,
            density_dpi: 160,
            rotation: 0,
            frame_rate: 50,
            bitrate: 1_000_000,
            iframe_interval_secs: 1,
            codec: VideoCodec::Raw,
        }
    }

    #[test]
    fn test_pattern_frame_size_and_pacing() {
        let clock = SessionClock::new();
        let mut source = TestPatternSource::new(&small_video(), clock);

        let first = source.read(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(first.data.len(), 32 * 16 * 4);

        // Next frame is due 20ms later, a 1ms poll cannot produce it
        assert!(source.read(Duration::from_millis(1)).unwrap().is_none());

        let second = source.read(Duration::from_millis(50)).unwrap().unwrap();
        assert!(second.pts_us >= first.pts_us);
    }

    #[test]
    fn test_pattern_suspended_produces_nothing() {
        let mut source = TestPatternSource::new(&small_video(), SessionClock::new());
        source.suspend().unwrap();
        assert!(source.read(Duration::from_millis(30)).unwrap().is_none());
        source.resume().unwrap();
        assert!(source.read(Duration::from_millis(30)).unwrap().is_some());
    }

    #[test]
    fn test_tone_chunk_layout() {
        let config = AudioConfig::internal(AudioCodec::Pcm);
        let mut source = ToneSource::new(&config, 440.0, SessionClock::new());
        let chunk = source.read(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(chunk.data.len(), SAMPLES_PER_CHUNK * 2 * 2);

        source.release();
        assert!(source.read(Duration::from_millis(1)).unwrap().is_none());
    }
}
