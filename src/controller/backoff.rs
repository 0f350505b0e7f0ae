//! Reconnect delays: exponential, capped, jittered, never decreasing

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{LinkError, Result};

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde(rename = "initial_ms", with = "crate::config::millis")]
    pub initial: Duration,
    #[serde(rename = "ceiling_ms", with = "crate::config::millis")]
    pub ceiling: Duration,
    pub multiplier: f64,
    /// Fraction of each delay added as random jitter, 0 to 1
    pub jitter: f64,
    /// Fixed RNG seed for reproducible delays
    pub seed: Option<u64>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            ceiling: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
            seed: None,
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.initial.is_zero() {
            return Err(LinkError::invalid_config("backoff.initial_ms", "must be non-zero"));
        }
        if self.ceiling < self.initial {
            return Err(LinkError::invalid_config("backoff.ceiling_ms", "must not be below initial_ms"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(LinkError::invalid_config("backoff.multiplier", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(LinkError::invalid_config("backoff.jitter", "must be between 0 and 1"));
        }
        Ok(())
    }
}

/// SplitMix64; enough randomness for spreading reconnect attempts.
#[derive(Debug, Clone)]
struct SplitMix64(u64);

impl SplitMix64 {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in `[0, 1)`.
    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// Delay generator for one reconnect cycle.
///
/// The n-th delay is `initial * multiplier^n` plus up to `jitter` of itself,
/// clamped to the ceiling and to at least the previous delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
    last: Duration,
    rng: SplitMix64,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let seed = policy.seed.unwrap_or_else(|| {
            SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0x5EED)
        });
        Self { policy, attempt: 0, last: Duration::ZERO, rng: SplitMix64(seed) }
    }

    /// Start a new cycle.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.policy.ceiling.as_secs_f64();
        let exponential =
            (self.policy.initial.as_secs_f64() * self.policy.multiplier.powi(self.attempt as i32)).min(ceiling);
        let jittered = exponential * (1.0 + self.policy.jitter * self.rng.next_f64());

        let delay = Duration::from_secs_f64(jittered.min(ceiling)).max(self.last);
        self.attempt = self.attempt.saturating_add(1);
        self.last = delay;
        delay
    }
}
