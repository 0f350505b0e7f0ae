//! Adaptive streaming controller.
//!
//! [`StreamController::spawn`] moves a [`StreamEngine`] onto a tokio task
//! and ticks it at the budget's frame interval. The returned
//! [`StreamHandle`] is the only way in:
//!
//! - renderers publish bitmaps into a single-slot [`FrameSlot`]; an unsent
//!   bitmap is replaced, never queued
//! - observers read [`StreamStatus`] snapshots from a watch channel
//! - budget, brightness and reconnect requests are validated on the
//!   caller's side and applied at the next tick boundary
//!
//! ```rust,no_run
//! use smartscreen::codec::{Bitmap, Rgb565};
//! use smartscreen::controller::StreamController;
//! use smartscreen::transport::SerialTransport;
//! use smartscreen::EngineConfig;
//!
//! # async fn run() -> smartscreen::Result<()> {
//! let mut handle = StreamController::spawn(SerialTransport::new(), EngineConfig::default())?;
//! handle.publish(Bitmap::filled(800, 480, Rgb565::BLACK))?;
//! println!("{}", handle.status().message);
//! handle.disconnect().await;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod budget;
mod engine;
mod metrics;
mod planner;
mod slot;

pub use backoff::{Backoff, BackoffPolicy};
pub use budget::{AdaptivePolicy, PerformanceBudget};
pub use engine::StreamEngine;
pub use metrics::MetricsTracker;
pub use planner::FramePlanner;
pub use slot::FrameSlot;

use engine::Command;
use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::codec::Bitmap;
use crate::config::EngineConfig;
use crate::session::SessionState;
use crate::transport::Transport;
use crate::types::StreamStatus;
use crate::{LinkError, Result};

/// Spawns the streaming loop.
pub struct StreamController;

impl StreamController {
    /// Validate `config` and start streaming over `transport`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn<T: Transport>(transport: T, config: EngineConfig) -> Result<StreamHandle> {
        let panel = (config.session.panel_width, config.session.panel_height);
        let engine = StreamEngine::new(transport, config)?;
        Ok(Self::spawn_engine(engine, panel))
    }

    fn spawn_engine<T: Transport>(engine: StreamEngine<T>, panel: (u16, u16)) -> StreamHandle {
        let cancel = CancellationToken::new();
        let status = engine.subscribe();
        let slot = engine.frame_slot();
        let commands = engine.command_sender();

        let task = tokio::spawn(Self::run(engine, cancel.clone()));
        StreamHandle { status, slot, commands, cancel, task: Some(task), panel }
    }

    async fn run<T: Transport>(mut engine: StreamEngine<T>, cancel: CancellationToken) {
        info!(fps = engine.budget().fps(), "Stream task started");
        let mut period = engine.frame_interval();
        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let now = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                now = ticker.tick() => now,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = engine.tick(now) => {}
            }

            let wanted = engine.frame_interval();
            if wanted != period {
                debug!(
                    from_ms = period.as_secs_f64() * 1000.0,
                    to_ms = wanted.as_secs_f64() * 1000.0,
                    "Frame interval changed"
                );
                period = wanted;
                ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            }
        }

        engine.shutdown().await;
        info!("Stream task ended");
    }
}

/// Caller side of a running stream. Dropping it stops the stream.
pub struct StreamHandle {
    status: watch::Receiver<StreamStatus>,
    slot: FrameSlot,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    panel: (u16, u16),
}

impl StreamHandle {
    /// Latest status snapshot.
    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    /// Status snapshots as a stream, starting with the current one.
    pub fn status_updates(&self) -> impl Stream<Item = StreamStatus> + 'static {
        WatchStream::new(self.status.clone())
    }

    /// Wait until the session reaches `state`.
    pub async fn wait_for_state(&self, state: SessionState) -> Result<StreamStatus> {
        let mut receiver = self.status.clone();
        let status = receiver
            .wait_for(|status| status.state == state)
            .await
            .map_err(|_| LinkError::link_lost("stream task stopped"))?;
        Ok(status.clone())
    }

    pub fn frame_slot(&self) -> FrameSlot {
        self.slot.clone()
    }

    /// Offer the next bitmap. Returns `true` if an unsent one was replaced.
    pub fn publish(&self, bitmap: Bitmap) -> Result<bool> {
        let (width, height) = self.panel;
        if bitmap.width() != width || bitmap.height() != height {
            return Err(LinkError::invalid_frame(format!(
                "bitmap is {}x{}, panel is {width}x{height}",
                bitmap.width(),
                bitmap.height()
            )));
        }
        Ok(self.slot.publish(bitmap))
    }

    /// Replace the performance budget from the next tick on.
    pub fn set_budget(&self, budget: PerformanceBudget) -> Result<()> {
        budget.validate()?;
        self.send(Command::SetBudget(budget), "set budget")
    }

    pub fn set_brightness(&self, percent: u8) -> Result<()> {
        if percent > 100 {
            return Err(LinkError::invalid_config("brightness", "must be 0 to 100"));
        }
        self.send(Command::SetBrightness(percent), "set brightness")
    }

    /// Connect now if disconnected, otherwise recycle the link.
    pub fn reconnect(&self) -> Result<()> {
        self.send(Command::Reconnect, "reconnect")
    }

    fn send(&self, command: Command, action: &'static str) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| LinkError::InvalidTransition { state: SessionState::Disconnected, action })
    }

    /// Stop the stream, close the link and wait for the task to finish.
    pub async fn disconnect(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                debug!(error = %err, "Stream task did not finish cleanly");
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        debug!("Dropping stream handle");
        self.cancel.cancel();
    }
}
