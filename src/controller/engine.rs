//! One tick of the streaming loop

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::backoff::Backoff;
use super::metrics::MetricsTracker;
use super::planner::FramePlanner;
use super::slot::FrameSlot;
use super::PerformanceBudget;
use crate::config::EngineConfig;
use crate::session::{Session, SessionState};
use crate::transport::Transport;
use crate::types::{ErrorSnapshot, RecoveryStatus, StreamStatus};
use crate::{LinkError, Result};

/// Requests from a [`StreamHandle`](super::StreamHandle), applied at the
/// start of the next tick.
#[derive(Debug)]
pub(crate) enum Command {
    SetBudget(PerformanceBudget),
    SetBrightness(u8),
    Reconnect,
}

/// A reconnect cycle in progress.
#[derive(Debug, Clone)]
struct RecoveryCycle {
    attempt: u32,
    started: Instant,
    next_attempt_at: Instant,
    reason: &'static str,
}

/// The streaming loop's state, advanced one [`tick`](Self::tick) at a time.
///
/// Owns the [`Session`]; nothing else touches the transport. The
/// [`StreamController`](super::StreamController) calls `tick` on a fixed
/// interval, tests can call it directly.
pub struct StreamEngine<T> {
    session: Session<T>,
    config: EngineConfig,
    slot: FrameSlot,
    planner: FramePlanner,
    metrics: MetricsTracker,
    backoff: Backoff,
    recovery: Option<RecoveryCycle>,
    next_connect_at: Option<Instant>,
    connect_requested: bool,
    halted: bool,
    divisor: u32,
    tick_index: u64,
    slow_streak: u32,
    healthy_streak: u32,
    last_error: Option<ErrorSnapshot>,
    status: watch::Sender<StreamStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
}

impl<T: Transport> StreamEngine<T> {
    pub fn new(transport: T, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let mut session = Session::new(transport, config.session.clone())?;
        session.set_failure_budget(config.budget.max_consecutive_failures);

        let planner =
            FramePlanner::new(config.session.panel_width, config.session.panel_height, config.adaptive.max_dirty_ratio);
        let (status, _) = watch::channel(StreamStatus::default());
        let (command_tx, commands) = mpsc::unbounded_channel();

        Ok(Self {
            session,
            planner,
            metrics: MetricsTracker::new(config.adaptive.latency_window),
            backoff: Backoff::new(config.backoff.clone()),
            config,
            slot: FrameSlot::new(),
            recovery: None,
            next_connect_at: None,
            connect_requested: false,
            halted: false,
            divisor: 1,
            tick_index: 0,
            slow_streak: 0,
            healthy_streak: 0,
            last_error: None,
            status,
            commands,
            command_tx,
        })
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// The handoff slot renderers publish into.
    pub fn frame_slot(&self) -> FrameSlot {
        self.slot.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    pub(crate) fn command_sender(&self) -> mpsc::UnboundedSender<Command> {
        self.command_tx.clone()
    }

    pub fn budget(&self) -> &PerformanceBudget {
        &self.config.budget
    }

    pub fn frame_interval(&self) -> Duration {
        self.config.budget.frame_interval
    }

    /// Only every `divisor`-th tick transmits.
    pub fn frame_divisor(&self) -> u32 {
        self.divisor
    }

    /// Advance the loop by one tick at `now`.
    pub async fn tick(&mut self, now: Instant) {
        self.apply_commands(now).await;

        match self.session.state() {
            SessionState::Disconnected => self.connect_if_due(now).await,
            SessionState::Recovering => self.reconnect_if_due(now).await,
            SessionState::Streaming | SessionState::Degraded => self.stream(now).await,
            SessionState::Ready => {
                if let Err(err) = self.session.begin_streaming() {
                    warn!(error = %err, "Could not start streaming");
                }
            }
            SessionState::Connecting | SessionState::Handshaking => {}
        }

        self.publish_status(Instant::now());
    }

    async fn apply_commands(&mut self, now: Instant) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::SetBudget(budget) => {
                    info!(
                        frame_interval_ms = budget.frame_interval.as_secs_f64() * 1000.0,
                        max_failures = budget.max_consecutive_failures,
                        "Applying new performance budget"
                    );
                    self.config.budget = budget;
                    self.session.set_failure_budget(budget.max_consecutive_failures);
                }
                Command::SetBrightness(percent) => {
                    if let Err(err) = self.session.set_brightness(percent).await {
                        self.note_error(&err);
                        if self.session.state() == SessionState::Recovering {
                            self.start_recovery(Instant::now(), &err);
                        }
                    }
                }
                Command::Reconnect => self.request_reconnect(now).await,
            }
        }
    }

    async fn request_reconnect(&mut self, now: Instant) {
        match self.session.state() {
            SessionState::Disconnected => {
                info!("Reconnect requested");
                self.halted = false;
                self.connect_requested = true;
                self.next_connect_at = None;
                self.backoff.reset();
            }
            SessionState::Recovering => {
                if let Some(cycle) = &mut self.recovery {
                    cycle.next_attempt_at = now;
                }
            }
            _ => {
                let reason = LinkError::link_lost("reconnect requested");
                if self.session.recover(&reason).await.is_ok() {
                    self.start_recovery(now, &reason);
                    if let Some(cycle) = &mut self.recovery {
                        cycle.next_attempt_at = now;
                    }
                }
            }
        }
    }

    async fn connect_if_due(&mut self, now: Instant) {
        if self.halted || !(self.config.auto_connect || self.connect_requested) {
            return;
        }
        if self.next_connect_at.is_some_and(|at| now < at) {
            return;
        }

        info!(device = %self.config.device, "Connecting to display");
        match self.session.connect(&self.config.device, &self.config.link).await {
            Ok(()) => self.on_connected(),
            Err(err) => {
                self.note_error(&err);
                self.connect_requested = false;
                if err.is_retryable() && self.config.auto_connect {
                    let delay = self.backoff.next_delay();
                    warn!(error = %err, retry_ms = delay.as_millis() as u64, "Connect failed, retrying");
                    self.next_connect_at = Some(Instant::now() + delay);
                } else {
                    error!(error = %err, code = err.reason_code(), "Connect failed");
                    for suggestion in err.recovery_suggestions() {
                        debug!(suggestion, "Recovery suggestion");
                    }
                    self.halted = true;
                }
            }
        }
    }

    async fn reconnect_if_due(&mut self, now: Instant) {
        if self.recovery.is_none() {
            let reason = LinkError::link_lost("session entered recovery");
            self.start_recovery(now, &reason);
        }
        let Some(cycle) = self.recovery.as_mut() else {
            return;
        };
        if now < cycle.next_attempt_at {
            return;
        }
        cycle.attempt += 1;
        info!(attempt = cycle.attempt, reason = cycle.reason, "Reconnect attempt");

        match self.session.connect(&self.config.device, &self.config.link).await {
            Ok(()) => self.on_connected(),
            Err(err) => {
                self.note_error(&err);
                let delay = self.backoff.next_delay();
                if let Some(cycle) = self.recovery.as_mut() {
                    cycle.next_attempt_at = Instant::now() + delay;
                    warn!(
                        attempt = cycle.attempt,
                        error = %err,
                        next_retry_ms = delay.as_millis() as u64,
                        "Reconnect attempt failed"
                    );
                }
            }
        }
    }

    fn on_connected(&mut self) {
        if let Err(err) = self.session.begin_streaming() {
            warn!(error = %err, "Could not start streaming");
            return;
        }
        if let Some(cycle) = self.recovery.take() {
            info!(attempts = cycle.attempt, elapsed_ms = cycle.started.elapsed().as_millis() as u64, "Display link recovered");
        } else {
            info!(port = self.session.descriptor().map(|d| d.port.as_str()), "Display link established");
        }
        self.planner.invalidate();
        self.metrics.reset_window();
        self.backoff.reset();
        self.next_connect_at = None;
        self.connect_requested = false;
        self.divisor = 1;
        self.slow_streak = 0;
        self.healthy_streak = 0;
    }

    fn start_recovery(&mut self, now: Instant, reason: &LinkError) {
        self.backoff.reset();
        let delay = self.backoff.next_delay();
        warn!(reason = reason.reason_code(), first_retry_ms = delay.as_millis() as u64, "Entering recovery");
        self.recovery = Some(RecoveryCycle {
            attempt: 0,
            started: now,
            next_attempt_at: now + delay,
            reason: reason.reason_code(),
        });
    }

    async fn stream(&mut self, now: Instant) {
        self.tick_index += 1;

        let Some(bitmap) = self.slot.take() else {
            self.metrics.record_idle();
            if let Err(err) = self.session.poll_link(Duration::ZERO).await {
                self.note_error(&err);
                if self.session.state() == SessionState::Recovering {
                    self.start_recovery(now, &err);
                }
            }
            return;
        };

        if self.divisor > 1 && self.tick_index % self.divisor as u64 != 0 {
            self.slot.restore(bitmap);
            self.metrics.record_skipped();
            return;
        }

        let frame = match self.planner.plan(&bitmap) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.metrics.record_idle();
                return;
            }
            Err(err) => {
                warn!(error = %err, "Dropping bitmap");
                self.note_error(&err);
                return;
            }
        };

        let started = Instant::now();
        match self.session.send_frame(&frame).await {
            Ok(stats) => {
                trace!(kind = ?frame.kind(), bytes = stats.bytes_written, "Tick sent frame");
                self.metrics.record_send(Instant::now(), &stats, frame.kind());
                self.planner.commit(bitmap);
                let slow = self.metrics.rolling_latency_ms() > self.max_latency_ms();
                self.adapt(slow);
            }
            Err(err) => {
                self.note_error(&err);
                self.planner.invalidate();
                self.slot.restore(bitmap);
                self.metrics.record_failure(started.elapsed().as_secs_f64() * 1000.0);
                self.adapt(true);
                if self.session.state() == SessionState::Recovering {
                    self.start_recovery(Instant::now(), &err);
                }
            }
        }
    }

    fn max_latency_ms(&self) -> f64 {
        self.config.budget.max_write_latency.as_secs_f64() * 1000.0
    }

    /// Halve the send rate after a slow streak, restore it after a healthy one.
    fn adapt(&mut self, slow: bool) {
        let policy = &self.config.adaptive;
        if slow {
            self.healthy_streak = 0;
            self.slow_streak += 1;
            if self.slow_streak > policy.streak_ticks && self.divisor < policy.max_frame_divisor {
                self.divisor *= 2;
                self.slow_streak = 0;
                info!(
                    divisor = self.divisor,
                    latency_ms = self.metrics.rolling_latency_ms(),
                    "Write latency over budget, reducing frame rate"
                );
            }
        } else {
            self.slow_streak = 0;
            self.healthy_streak += 1;
            if self.healthy_streak >= policy.streak_ticks && self.divisor > 1 {
                self.divisor /= 2;
                self.healthy_streak = 0;
                info!(divisor = self.divisor, "Write latency healthy, raising frame rate");
            }
        }
    }

    fn note_error(&mut self, err: &LinkError) {
        self.last_error = Some(ErrorSnapshot::from(err));
    }

    fn publish_status(&mut self, now: Instant) {
        self.metrics.set_overwritten(self.slot.overwritten());
        let metrics = self.metrics.snapshot(self.divisor);
        let state = self.session.state();

        let recovery = match state {
            SessionState::Recovering => self.recovery.as_ref().map(|cycle| RecoveryStatus {
                attempt: cycle.attempt,
                elapsed_ms: now.saturating_duration_since(cycle.started).as_millis() as u64,
                next_retry_ms: cycle.next_attempt_at.saturating_duration_since(now).as_millis() as u64,
                reason: cycle.reason.to_string(),
            }),
            _ => None,
        };
        let message = StreamStatus::describe(state, &metrics, recovery.as_ref(), self.last_error.as_ref());
        let next = StreamStatus {
            state,
            port: self.session.descriptor().map(|d| d.port.clone()),
            metrics,
            recovery,
            last_error: self.last_error.clone(),
            message,
        };

        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Close the link and publish the final status.
    pub async fn shutdown(&mut self) {
        info!("Stopping display stream");
        self.session.disconnect().await;
        self.recovery = None;
        self.publish_status(Instant::now());
    }
}
