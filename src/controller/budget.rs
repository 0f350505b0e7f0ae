//! Performance budget and adaptation thresholds

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{LinkError, Result};

/// Target cadence and tolerances for the streaming loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceBudget {
    /// Time between ticks
    #[serde(rename = "frame_interval_ms", with = "crate::config::millis")]
    pub frame_interval: Duration,
    /// Rolling write latency above which a tick counts as slow
    #[serde(rename = "max_write_latency_ms", with = "crate::config::millis")]
    pub max_write_latency: Duration,
    /// Consecutive failed frames tolerated before the link is recycled
    pub max_consecutive_failures: u32,
}

impl Default for PerformanceBudget {
    fn default() -> Self {
        Self::at_fps(30.0)
    }
}

impl PerformanceBudget {
    /// Budget for `fps` frames per second, with write latency allowed to use
    /// the whole interval.
    pub fn from_fps(fps: f64) -> Result<Self> {
        if !fps.is_finite() || fps <= 0.0 || fps > 1000.0 {
            return Err(LinkError::invalid_config("budget.frame_interval_ms", format!("{fps} fps is out of range")));
        }
        Ok(Self::at_fps(fps))
    }

    fn at_fps(fps: f64) -> Self {
        let interval = Duration::from_secs_f64(1.0 / fps);
        Self { frame_interval: interval, max_write_latency: interval, max_consecutive_failures: 3 }
    }

    /// Target frames per second.
    pub fn fps(&self) -> f64 {
        1.0 / self.frame_interval.as_secs_f64()
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_interval < Duration::from_millis(1) {
            return Err(LinkError::invalid_config("budget.frame_interval_ms", "must be at least 1 ms"));
        }
        if self.max_write_latency.is_zero() {
            return Err(LinkError::invalid_config("budget.max_write_latency_ms", "must be non-zero"));
        }
        Ok(())
    }
}

/// How the controller reacts to sustained slowness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptivePolicy {
    /// Consecutive slow (or healthy) ticks before the divisor changes
    pub streak_ticks: u32,
    /// Upper bound for the frame divisor
    pub max_frame_divisor: u32,
    /// Changed-area fraction above which a full frame is sent instead
    pub max_dirty_ratio: f64,
    /// Number of writes in the rolling latency mean
    pub latency_window: usize,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self { streak_ticks: 5, max_frame_divisor: 8, max_dirty_ratio: 0.35, latency_window: 10 }
    }
}

impl AdaptivePolicy {
    pub fn validate(&self) -> Result<()> {
        if self.streak_ticks == 0 {
            return Err(LinkError::invalid_config("adaptive.streak_ticks", "must be non-zero"));
        }
        if self.max_frame_divisor == 0 || !self.max_frame_divisor.is_power_of_two() {
            return Err(LinkError::invalid_config("adaptive.max_frame_divisor", "must be a power of two"));
        }
        if !(0.0..=1.0).contains(&self.max_dirty_ratio) {
            return Err(LinkError::invalid_config("adaptive.max_dirty_ratio", "must be between 0 and 1"));
        }
        if self.latency_window == 0 {
            return Err(LinkError::invalid_config("adaptive.latency_window", "must be non-zero"));
        }
        Ok(())
    }
}
