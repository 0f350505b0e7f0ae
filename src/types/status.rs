//! Immutable status snapshots handed to observers

use serde::{Deserialize, Serialize};

use crate::LinkError;
use crate::session::SessionState;

/// Rolling stream measurements.
///
/// Owned and mutated by the streaming controller only; observers always
/// receive a copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct StreamMetrics {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    /// Achieved frames per second over the rolling window
    pub fps: f64,
    /// Achieved bytes per second over the rolling window
    pub throughput_bps: f64,
    /// Smoothed per-write link speed
    pub link_bps: f64,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub full_frames: u64,
    pub dirty_frames: u64,
    /// Ticks that had a frame ready but were skipped by the rate divisor
    pub skipped_ticks: u64,
    /// Ticks with nothing new to send
    pub idle_ticks: u64,
    /// Bitmaps overwritten in the handoff slot before being sent
    pub overwritten_frames: u64,
    /// Rolling mean of frame write latency
    pub write_latency_ms: f64,
    /// Only every Nth tick transmits
    pub frame_divisor: u32,
}

/// Progress of an ongoing reconnect cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct RecoveryStatus {
    /// Connect attempts made in this cycle
    pub attempt: u32,
    /// Time since the cycle began
    pub elapsed_ms: u64,
    /// Delay before the next attempt
    pub next_retry_ms: u64,
    /// Reason code of the failure that started the cycle
    pub reason: String,
}

/// Serializable copy of a [`LinkError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct ErrorSnapshot {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&LinkError> for ErrorSnapshot {
    fn from(err: &LinkError) -> Self {
        Self {
            code: err.reason_code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Everything a front end needs to render a status banner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct StreamStatus {
    pub state: SessionState,
    pub port: Option<String>,
    pub metrics: StreamMetrics,
    pub recovery: Option<RecoveryStatus>,
    pub last_error: Option<ErrorSnapshot>,
    /// One human-readable line
    pub message: String,
}

impl Default for StreamStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            port: None,
            metrics: StreamMetrics { frame_divisor: 1, ..StreamMetrics::default() },
            recovery: None,
            last_error: None,
            message: "Disconnected".to_string(),
        }
    }
}

impl StreamStatus {
    /// Compose the banner line for the current state.
    pub fn describe(
        state: SessionState,
        metrics: &StreamMetrics,
        recovery: Option<&RecoveryStatus>,
        last_error: Option<&ErrorSnapshot>,
    ) -> String {
        match state {
            SessionState::Streaming => format!("Streaming at {:.1} fps", metrics.fps),
            SessionState::Degraded => format!(
                "Degraded: {} consecutive write failures",
                metrics.consecutive_failures
            ),
            SessionState::Recovering => match recovery {
                Some(recovery) => format!(
                    "Reconnecting (attempt {}, {:.1}s): {}",
                    recovery.attempt,
                    recovery.elapsed_ms as f64 / 1000.0,
                    recovery.reason
                ),
                None => "Reconnecting".to_string(),
            },
            SessionState::Connecting => "Connecting".to_string(),
            SessionState::Handshaking => "Handshaking".to_string(),
            SessionState::Ready => "Connected".to_string(),
            SessionState::Disconnected => match last_error {
                Some(error) => format!("Disconnected: {}", error.message),
                None => "Disconnected".to_string(),
            },
        }
    }
}
