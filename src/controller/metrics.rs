//! Rolling stream measurements

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::session::SendStats;
use crate::types::{FrameKind, StreamMetrics};

/// Sends kept for the FPS and throughput window.
const RATE_WINDOW: usize = 30;

/// Weight of the newest sample in the link speed average.
const LINK_EWMA_ALPHA: f64 = 0.25;

/// Accumulates [`StreamMetrics`] from the controller's tick results.
#[derive(Debug, Clone)]
pub struct MetricsTracker {
    totals: StreamMetrics,
    sends: VecDeque<(Instant, usize)>,
    latencies: VecDeque<f64>,
    latency_window: usize,
}

impl MetricsTracker {
    pub fn new(latency_window: usize) -> Self {
        Self {
            totals: StreamMetrics { frame_divisor: 1, ..StreamMetrics::default() },
            sends: VecDeque::with_capacity(RATE_WINDOW + 1),
            latencies: VecDeque::with_capacity(latency_window + 1),
            latency_window: latency_window.max(1),
        }
    }

    pub fn record_send(&mut self, now: Instant, stats: &SendStats, kind: FrameKind) {
        let totals = &mut self.totals;
        totals.frames_sent += 1;
        totals.bytes_sent += stats.bytes_written as u64;
        totals.consecutive_failures = 0;
        match kind {
            FrameKind::Full => totals.full_frames += 1,
            FrameKind::Dirty => totals.dirty_frames += 1,
        }

        let seconds = stats.elapsed.as_secs_f64();
        if seconds > 0.0 {
            let sample = stats.bytes_written as f64 / seconds;
            totals.link_bps = if totals.link_bps == 0.0 {
                sample
            } else {
                (1.0 - LINK_EWMA_ALPHA) * totals.link_bps + LINK_EWMA_ALPHA * sample
            };
        }

        self.sends.push_back((now, stats.bytes_written));
        if self.sends.len() > RATE_WINDOW {
            self.sends.pop_front();
        }
        self.push_latency(stats.elapsed.as_secs_f64() * 1000.0);
    }

    fn push_latency(&mut self, millis: f64) {
        self.latencies.push_back(millis);
        if self.latencies.len() > self.latency_window {
            self.latencies.pop_front();
        }
    }

    /// A failed frame, counted with its latency so slowness is still seen.
    pub fn record_failure(&mut self, latency_ms: f64) {
        self.totals.consecutive_failures += 1;
        self.totals.total_failures += 1;
        self.push_latency(latency_ms);
    }

    pub fn record_idle(&mut self) {
        self.totals.idle_ticks += 1;
    }

    pub fn record_skipped(&mut self) {
        self.totals.skipped_ticks += 1;
    }

    pub fn set_overwritten(&mut self, overwritten: u64) {
        self.totals.overwritten_frames = overwritten;
    }

    /// Mean of the recent write latencies, 0 before the first write.
    pub fn rolling_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        self.latencies.iter().sum::<f64>() / self.latencies.len() as f64
    }

    /// Forget rate history; totals are kept across reconnects.
    pub fn reset_window(&mut self) {
        self.sends.clear();
        self.latencies.clear();
        self.totals.consecutive_failures = 0;
    }

    pub fn snapshot(&self, frame_divisor: u32) -> StreamMetrics {
        let mut metrics = self.totals.clone();
        metrics.frame_divisor = frame_divisor;
        metrics.write_latency_ms = self.rolling_latency_ms();

        if let (Some((first, _)), Some((last, _))) = (self.sends.front(), self.sends.back()) {
            let span = last.duration_since(*first).as_secs_f64();
            if span > 0.0 {
                let intervals = (self.sends.len() - 1) as f64;
                let bytes: usize = self.sends.iter().skip(1).map(|(_, bytes)| bytes).sum();
                metrics.fps = intervals / span;
                metrics.throughput_bps = bytes as f64 / span;
            }
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rect;
    use std::time::Duration;

    fn stats(bytes: usize, elapsed_ms: u64) -> SendStats {
        SendStats {
            window: Rect::new(0, 0, 10, 10),
            bytes_written: bytes,
            writes: 1,
            window_sent: true,
            elapsed: Duration::from_millis(elapsed_ms),
        }
    }

    #[test]
    fn fps_and_throughput_from_send_spacing() {
        let mut tracker = MetricsTracker::new(10);
        let start = Instant::now();
        for i in 0..11u64 {
            tracker.record_send(start + Duration::from_millis(100 * i), &stats(1000, 5), FrameKind::Dirty);
        }
        let metrics = tracker.snapshot(1);
        assert_eq!(metrics.frames_sent, 11);
        assert!((metrics.fps - 10.0).abs() < 1e-6);
        assert!((metrics.throughput_bps - 10_000.0).abs() < 1e-6);
        assert!((metrics.write_latency_ms - 5.0).abs() < 1e-6);
        assert_eq!(metrics.dirty_frames, 11);
    }

    #[test]
    fn link_speed_is_smoothed() {
        let mut tracker = MetricsTracker::new(10);
        let now = Instant::now();
        tracker.record_send(now, &stats(1000, 1000), FrameKind::Full);
        assert!((tracker.snapshot(1).link_bps - 1000.0).abs() < 1e-6);
        tracker.record_send(now, &stats(5000, 1000), FrameKind::Full);
        assert!((tracker.snapshot(1).link_bps - 2000.0).abs() < 1e-6);
    }

    #[test]
    fn failures_count_and_reset_on_success() {
        let mut tracker = MetricsTracker::new(2);
        tracker.record_failure(50.0);
        tracker.record_failure(70.0);
        tracker.record_failure(90.0);
        let metrics = tracker.snapshot(2);
        assert_eq!(metrics.consecutive_failures, 3);
        assert_eq!(metrics.total_failures, 3);
        assert!((metrics.write_latency_ms - 80.0).abs() < 1e-6);
        assert_eq!(metrics.frame_divisor, 2);

        tracker.record_send(Instant::now(), &stats(10, 1), FrameKind::Dirty);
        assert_eq!(tracker.snapshot(1).consecutive_failures, 0);
        assert_eq!(tracker.snapshot(1).total_failures, 3);
    }
}
