//! Protocol stack and adaptive streaming engine for USB-serial smart screen
//! displays.
//!
//! Drives the revision A 800×480 panel (`1A86:5722`): negotiates the link,
//! streams RGB565 frames at a budgeted rate, and keeps going through cable
//! unplugs, slow hosts and saturated serial buffers.
//!
//! # Features
//!
//! - **Frame codec**: RGB565 little-endian packing and dirty-rectangle diffing
//! - **Session state machine**: handshake, setup and degraded/recovery
//!   transitions over any [`Transport`](transport::Transport)
//! - **Adaptive streaming**: fixed-interval ticks, single-slot bitmap handoff,
//!   frame-rate backoff under load, jittered reconnects
//! - **Replay**: run the same session logic against recorded transcripts and
//!   report every byte that differs
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use smartscreen::codec::{Bitmap, Rgb565};
//! use smartscreen::{EngineConfig, SmartScreen};
//!
//! #[tokio::main]
//! async fn main() -> smartscreen::Result<()> {
//!     let mut stream = SmartScreen::stream(EngineConfig::default())?;
//!     stream.publish(Bitmap::filled(800, 480, Rgb565::from_rgb888(0, 64, 128)))?;
//!
//!     let status = stream.status();
//!     println!("{}", status.message);
//!     stream.disconnect().await;
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod codec;
pub mod config;
mod error;
pub mod protocol;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Link and streaming layers
pub mod controller;
pub mod replay;
pub mod session;
pub mod transport;

// Core exports
pub use config::EngineConfig;
pub use error::*;
pub use types::*;

// Main API exports
pub use controller::{PerformanceBudget, StreamController, StreamHandle};
pub use replay::{ReplayAnalyzer, ReplayReport, Transcript};
pub use session::{Session, SessionConfig, SessionState};

/// Unified entry point for driving a display.
///
/// # Examples
///
/// ## Stream to the first attached display
/// ```rust,no_run
/// use smartscreen::{EngineConfig, SmartScreen};
///
/// #[tokio::main]
/// async fn main() -> smartscreen::Result<()> {
///     let stream = SmartScreen::stream(EngineConfig::default())?;
///     let mut updates = stream.status_receiver();
///     updates.changed().await.ok();
///     println!("{}", updates.borrow().message);
///     Ok(())
/// }
/// ```
///
/// ## Check a recorded transcript
/// ```rust,no_run
/// use smartscreen::{SessionConfig, SmartScreen};
///
/// #[tokio::main]
/// async fn main() -> smartscreen::Result<()> {
///     let report = SmartScreen::replay("session.jsonl", SessionConfig::default()).await?;
///     assert!(report.passed());
///     Ok(())
/// }
/// ```
pub struct SmartScreen;

impl SmartScreen {
    /// Start streaming over the serial port selected by `config.device`.
    ///
    /// Returns immediately; connection happens on the stream task and is
    /// reported through the handle's status. Only configuration errors are
    /// returned here.
    pub fn stream(config: EngineConfig) -> Result<StreamHandle> {
        StreamController::spawn(transport::SerialTransport::new(), config)
    }

    /// Start streaming over any transport.
    pub fn stream_with<T: transport::Transport>(transport: T, config: EngineConfig) -> Result<StreamHandle> {
        StreamController::spawn(transport, config)
    }

    /// List attached displays matching the revision A USB IDs.
    pub fn discover() -> Result<Vec<DeviceDescriptor>> {
        transport::discover()
    }

    /// Replay a transcript file using the frames it carries.
    pub async fn replay<P: AsRef<std::path::Path>>(path: P, config: SessionConfig) -> Result<ReplayReport> {
        let transcript = Transcript::load(path)?;
        ReplayAnalyzer::new(config)?.replay_recorded(&transcript).await
    }
}
