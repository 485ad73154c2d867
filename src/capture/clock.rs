//! Session clock
//!
//! Both streams stamp their input from the same monotonic origin. Time stops
//! while the session is paused, so timestamps continue from where they left
//! off on resume instead of jumping or restarting at zero.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct PauseState {
    paused_at: Option<Instant>,
    total_paused: Duration,
}

/// Shared monotonic clock for one session
#[derive(Debug, Clone)]
pub struct SessionClock {
    origin: Instant,
    state: Arc<Mutex<PauseState>>,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Arc::new(Mutex::new(PauseState {
                paused_at: None,
                total_paused: Duration::ZERO,
            })),
        }
    }

    /// Recorded time since the session started, in microseconds
    pub fn now_us(&self) -> u64 {
        let state = self.state.lock();
        let now = state.paused_at.unwrap_or_else(Instant::now);
        let elapsed = now
            .saturating_duration_since(self.origin)
            .saturating_sub(state.total_paused);
        elapsed.as_micros() as u64
    }

    /// Current time, or `None` while paused
    pub fn running_now_us(&self) -> Option<u64> {
        let state = self.state.lock();
        if state.paused_at.is_some() {
            return None;
        }
        let elapsed = Instant::now()
            .saturating_duration_since(self.origin)
            .saturating_sub(state.total_paused);
        Some(elapsed.as_micros() as u64)
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        if state.paused_at.is_none() {
            state.paused_at = Some(Instant::now());
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        if let Some(paused_at) = state.paused_at.take() {
            state.total_paused += paused_at.elapsed();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused_at.is_some()
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}
