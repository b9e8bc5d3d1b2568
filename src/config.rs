/// Engine configuration - timing window and queue sizes
use std::time::Duration;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// How far ahead of the clock steps are dispatched.
    pub lookahead: Duration,
    /// Period of the timing loop. Must be shorter than `lookahead`.
    pub check_interval: Duration,
    /// Steps per beat (4 = 16th notes).
    pub steps_per_beat: u32,
    /// Most overdue steps fired in one tick before the scheduler skips ahead.
    pub max_catch_up_steps: usize,
    /// Capacity of the queue between the scheduler and the audio callback.
    pub voice_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lookahead: Duration::from_millis(100),
            check_interval: Duration::from_millis(25),
            steps_per_beat: 4,
            max_catch_up_steps: 16,
            voice_queue_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn with_lookahead(mut self, lookahead: Duration) -> Self {
        self.lookahead = lookahead;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_steps_per_beat(mut self, steps: u32) -> Self {
        self.steps_per_beat = steps;
        self
    }

    pub fn with_max_catch_up_steps(mut self, steps: usize) -> Self {
        self.max_catch_up_steps = steps;
        self
    }

    pub fn with_voice_queue_capacity(mut self, capacity: usize) -> Self {
        self.voice_queue_capacity = capacity;
        self
    }

    /// Lookahead horizon in clock seconds
    pub fn lookahead_secs(&self) -> f64 {
        self.lookahead.as_secs_f64()
    }

    pub fn validate(&self) -> Result<()> {
        if self.lookahead.is_zero() {
            return Err(EngineError::InvalidConfig("lookahead must be non-zero".into()));
        }
        if self.check_interval.is_zero() {
            return Err(EngineError::InvalidConfig(
                "check interval must be non-zero".into(),
            ));
        }
        if self.check_interval >= self.lookahead {
            return Err(EngineError::InvalidConfig(format!(
                "check interval ({:?}) must be shorter than lookahead ({:?})",
                self.check_interval, self.lookahead
            )));
        }
        if self.steps_per_beat == 0 {
            return Err(EngineError::InvalidConfig(
                "steps per beat must be at least 1".into(),
            ));
        }
        if self.max_catch_up_steps == 0 {
            return Err(EngineError::InvalidConfig(
                "catch-up bound must be at least 1".into(),
            ));
        }
        if self.voice_queue_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "voice queue capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
