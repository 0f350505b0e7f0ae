//! Protocol session: the connection state machine and sole writer of
//! protocol bytes.
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Ready -> Streaming <-> Degraded
//!                    ^                                                 |
//!                    +----------- Recovering <--- budget exceeded -----+
//! ```
//!
//! A failed connect returns to the state it started from (`Disconnected` or
//! `Recovering`). `disconnect()` reaches `Disconnected` from anywhere.
//!
//! Every transition is logged; with [`Session::with_trace`] they are also
//! kept as a [`Transition`] list for replay reports and tests.
//!
//! After setup the panel is left with a full-screen window armed, so the
//! first full frame goes out without a second window command. While a
//! window is waiting for pixels every byte written is pixel data, so other
//! commands (brightness) are held back until it completes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::protocol::{HELLO_LEN, Orientation, ProtocolCommand, SubRevision, classify_hello_reply};
use crate::transport::Transport;
use crate::types::{DeviceDescriptor, DeviceSelector, ErrorSnapshot, Frame, LinkParams, PANEL_HEIGHT, PANEL_WIDTH, Rect};
use crate::{LinkError, Result};


/// Connection state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Streaming,
    Degraded,
    Recovering,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Disconnected, Disconnected) => false,
            (_, Disconnected) => true,
            (Disconnected | Recovering, Connecting) => true,
            (Connecting, Handshaking) => true,
            (Handshaking, Ready) => true,
            (Ready, Streaming) => true,
            (Streaming, Degraded) | (Degraded, Streaming) => true,
            // failure jump from any live state
            (Recovering, Recovering) => false,
            (Connecting | Handshaking | Ready | Streaming | Degraded, Recovering) => true,
            _ => false,
        }
    }

    /// The link is open and set up.
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Streaming | SessionState::Degraded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Streaming => "streaming",
            SessionState::Degraded => "degraded",
            SessionState::Recovering => "recovering",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    /// The failure that caused the change, if any
    pub error: Option<ErrorSnapshot>,
}

/// Per-session protocol settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub panel_width: u16,
    pub panel_height: u16,
    pub orientation: Orientation,
    /// Bytes per pixel-stream write
    pub chunk_size: usize,
    #[serde(rename = "handshake_timeout_ms", with = "crate::config::millis")]
    pub handshake_timeout: Duration,
    #[serde(rename = "write_timeout_ms", with = "crate::config::millis")]
    pub write_timeout: Duration,
    /// Treat a device that never answers HELLO as ready
    pub accept_silent_hello: bool,
    /// Backlight in percent, sent after setup
    pub brightness: Option<u8>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            panel_width: PANEL_WIDTH,
            panel_height: PANEL_HEIGHT,
            orientation: Orientation::Landscape,
            chunk_size: PANEL_WIDTH as usize * 8,
            handshake_timeout: Duration::from_millis(1000),
            write_timeout: Duration::from_millis(1000),
            accept_silent_hello: false,
            brightness: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.panel_width == 0 || self.panel_height == 0 {
            return Err(LinkError::invalid_config("session.panel_width", "panel dimensions must be non-zero"));
        }
        if self.chunk_size == 0 {
            return Err(LinkError::invalid_config("session.chunk_size", "must be non-zero"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(LinkError::invalid_config("session.handshake_timeout_ms", "must be non-zero"));
        }
        if self.write_timeout.is_zero() {
            return Err(LinkError::invalid_config("session.write_timeout_ms", "must be non-zero"));
        }
        if let Some(percent) = self.brightness {
            if percent > 100 {
                return Err(LinkError::invalid_config("session.brightness", "must be 0 to 100"));
            }
        }
        Ok(())
    }

    /// Rectangle covering the whole panel.
    pub fn full_rect(&self) -> Rect {
        Rect::full(self.panel_width, self.panel_height)
    }
}

/// What one [`Session::send_frame`] put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendStats {
    pub window: Rect,
    pub bytes_written: usize,
    pub writes: usize,
    /// Whether a window command preceded the pixels
    pub window_sent: bool,
    pub elapsed: Duration,
}

/// A window the panel is filling with pixel bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArmedWindow {
    rect: Rect,
    sent: usize,
}

/// Connection state machine over a [`Transport`].
pub struct Session<T> {
    transport: T,
    config: SessionConfig,
    state: SessionState,
    descriptor: Option<DeviceDescriptor>,
    sub_revision: Option<SubRevision>,
    armed: Option<ArmedWindow>,
    pending_brightness: Option<u8>,
    failure_count: u32,
    failure_budget: u32,
    last_error: Option<ErrorSnapshot>,
    trace: Option<Vec<Transition>>,
}

impl<T: Transport> Session<T> {
    /// Default number of consecutive write failures tolerated in Degraded.
    pub const DEFAULT_FAILURE_BUDGET: u32 = 3;

    pub fn new(transport: T, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            config,
            state: SessionState::Disconnected,
            descriptor: None,
            sub_revision: None,
            armed: None,
            pending_brightness: None,
            failure_count: 0,
            failure_budget: Self::DEFAULT_FAILURE_BUDGET,
            last_error: None,
            trace: None,
        })
    }

    /// Keep every transition for later inspection.
    pub fn with_trace(mut self) -> Self {
        self.trace = Some(Vec::new());
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }

    /// Variant reported by the last successful handshake.
    pub fn sub_revision(&self) -> Option<SubRevision> {
        self.sub_revision
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn failure_budget(&self) -> u32 {
        self.failure_budget
    }

    pub fn set_failure_budget(&mut self, budget: u32) {
        self.failure_budget = budget;
    }

    pub fn last_error(&self) -> Option<&ErrorSnapshot> {
        self.last_error.as_ref()
    }

    /// Transitions recorded so far (empty unless tracing).
    pub fn transitions(&self) -> &[Transition] {
        self.trace.as_deref().unwrap_or_default()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn transition(&mut self, to: SessionState, error: Option<&LinkError>) {
        let from = self.state;
        debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");
        self.state = to;

        let snapshot = error.map(ErrorSnapshot::from);
        match &snapshot {
            Some(err) => warn!(%from, %to, code = %err.code, error = %err.message, "Session transition"),
            None => info!(%from, %to, "Session transition"),
        }
        if snapshot.is_some() {
            self.last_error = snapshot.clone();
        }
        if let Some(trace) = &mut self.trace {
            trace.push(Transition { from, to, error: snapshot });
        }
    }

    /// Resolve, open, handshake and set up the display.
    ///
    /// Valid from `Disconnected` and `Recovering`. On failure the transport
    /// is closed and the session returns to the state it started from.
    pub async fn connect(&mut self, selector: &DeviceSelector, link: &LinkParams) -> Result<()> {
        let origin = self.state;
        if !matches!(origin, SessionState::Disconnected | SessionState::Recovering) {
            return Err(LinkError::InvalidTransition { state: origin, action: "connect" });
        }

        self.transition(SessionState::Connecting, None);
        match self.establish(selector, link).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.release().await;
                let fallback = match origin {
                    SessionState::Recovering => SessionState::Recovering,
                    _ => SessionState::Disconnected,
                };
                self.transition(fallback, Some(&err));
                Err(err)
            }
        }
    }

    async fn establish(&mut self, selector: &DeviceSelector, link: &LinkParams) -> Result<()> {
        let descriptor = self.transport.resolve(selector, link).await?;
        self.transport.open(&descriptor).await?;
        debug!(port = %descriptor.port, "Display port open");
        self.descriptor = Some(descriptor);

        self.transition(SessionState::Handshaking, None);
        let sub_revision = self.handshake().await?;
        info!(sub_revision = sub_revision.name(), "Display answered HELLO");
        self.sub_revision = Some(sub_revision);

        self.transition(SessionState::Ready, None);
        self.setup().await?;
        self.failure_count = 0;
        Ok(())
    }

    async fn handshake(&mut self) -> Result<SubRevision> {
        let timeout = self.config.handshake_timeout;
        self.transport.discard_input().await?;

        match self.send(&ProtocolCommand::Hello, timeout).await {
            Err(LinkError::WriteTimeout { .. }) => return Err(LinkError::HandshakeTimeout { timeout }),
            other => other?,
        };

        let deadline = Instant::now() + timeout;
        let mut reply = Vec::with_capacity(HELLO_LEN);
        while reply.len() < HELLO_LEN {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let chunk = self.transport.read(HELLO_LEN - reply.len(), remaining).await?;
            if chunk.is_empty() {
                break;
            }
            reply.extend_from_slice(&chunk);
        }

        if reply.is_empty() {
            if self.config.accept_silent_hello {
                warn!("Display did not answer HELLO, continuing in lenient mode");
                return Ok(SubRevision::Silent);
            }
            return Err(LinkError::HandshakeTimeout { timeout });
        }

        classify_hello_reply(&reply).ok_or_else(|| LinkError::HandshakeRejected { reply: hex::encode(&reply) })
    }

    async fn setup(&mut self) -> Result<()> {
        let timeout = self.config.write_timeout;
        self.send(&ProtocolCommand::SetOrientation(self.config.orientation), timeout).await?;
        if let Some(percent) = self.config.brightness {
            self.send(&ProtocolCommand::SetBrightness(percent), timeout).await?;
        }
        let full = self.config.full_rect();
        self.send(&ProtocolCommand::SetWindow(full), timeout).await?;
        self.armed = Some(ArmedWindow { rect: full, sent: 0 });
        self.pending_brightness = None;
        Ok(())
    }

    /// Write one command in a single transport write.
    async fn send(&mut self, command: &ProtocolCommand, timeout: Duration) -> Result<usize> {
        let bytes = command.encode();
        trace!(command = command.name(), len = bytes.len(), "Sending command");
        let written = self.transport.write(&bytes, timeout).await?;
        if written != bytes.len() {
            return Err(LinkError::WriteTimeout { timeout, written, expected: bytes.len() });
        }
        Ok(written)
    }

    /// Ready → Streaming.
    pub fn begin_streaming(&mut self) -> Result<()> {
        if self.state != SessionState::Ready {
            return Err(LinkError::InvalidTransition { state: self.state, action: "begin streaming" });
        }
        self.transition(SessionState::Streaming, None);
        Ok(())
    }

    /// Send one encoded frame.
    ///
    /// Valid while `Streaming` or `Degraded`. A write failure counts against
    /// the failure budget: the first moves the session to `Degraded`, and
    /// exceeding the budget closes the transport and moves to `Recovering`.
    /// The next successful frame from `Degraded` returns to `Streaming`.
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<SendStats> {
        if !matches!(self.state, SessionState::Streaming | SessionState::Degraded) {
            return Err(LinkError::InvalidTransition { state: self.state, action: "send a frame" });
        }
        let rect = frame.rect();
        if !rect.fits_within(self.config.panel_width, self.config.panel_height) {
            return Err(LinkError::invalid_frame(format!(
                "window {rect:?} outside {}x{} panel",
                self.config.panel_width, self.config.panel_height
            )));
        }

        let started = Instant::now();
        match self.write_frame(frame).await {
            Ok((bytes_written, writes, window_sent)) => {
                if self.state == SessionState::Degraded {
                    self.transition(SessionState::Streaming, None);
                }
                self.failure_count = 0;
                let stats = SendStats { window: rect, bytes_written, writes, window_sent, elapsed: started.elapsed() };
                debug!(window = ?rect, bytes = bytes_written, elapsed_ms = stats.elapsed.as_millis() as u64, "Frame sent");

                if let Some(percent) = self.pending_brightness.take() {
                    if let Err(err) = self.send(&ProtocolCommand::SetBrightness(percent), self.config.write_timeout).await
                    {
                        self.pending_brightness = Some(percent);
                        return Err(self.on_write_failure(err).await);
                    }
                }
                Ok(stats)
            }
            Err(err) => Err(self.on_write_failure(err).await),
        }
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<(usize, usize, bool)> {
        let rect = frame.rect();
        let timeout = self.config.write_timeout;
        let mut bytes_written = 0;
        let mut writes = 0;

        let needs_window = match self.armed {
            Some(ArmedWindow { rect: armed, sent: 0 }) if armed == rect => false,
            Some(armed) => {
                // Finish the interrupted window before anything else
                let remaining = armed.rect.byte_len() - armed.sent;
                let filler: Arc<[u8]> = if armed.rect == rect {
                    Arc::from(&frame.data()[armed.sent..])
                } else {
                    // The panel takes every byte as pixels until the window is
                    // full. A write failure makes the controller repaint the
                    // whole panel next, so the black padding is overdrawn.
                    Arc::from(vec![0u8; remaining])
                };
                debug!(window = ?armed.rect, remaining, "Completing interrupted window");
                let (written, count) = self.write_pixels(ProtocolCommand::PixelStream(filler)).await?;
                bytes_written += written;
                writes += count;
                true
            }
            None => true,
        };

        if needs_window {
            bytes_written += self.send(&ProtocolCommand::SetWindow(rect), timeout).await?;
            writes += 1;
            self.armed = Some(ArmedWindow { rect, sent: 0 });
        }

        let (written, count) = self.write_pixels(ProtocolCommand::PixelStream(frame.shared_data())).await?;
        Ok((bytes_written + written, writes + count, needs_window))
    }

    /// Stream a pixel command into the armed window in chunks.
    async fn write_pixels(&mut self, command: ProtocolCommand) -> Result<(usize, usize)> {
        let timeout = self.config.write_timeout;
        let data = command.encode();
        trace!(command = command.name(), len = data.len(), chunk_size = self.config.chunk_size, "Sending command");
        let mut writes = 0;
        let mut total = 0;

        for chunk in data.chunks(self.config.chunk_size) {
            let result = self.transport.write(chunk, timeout).await;
            let written = match &result {
                Ok(n) => *n,
                Err(LinkError::WriteTimeout { written, .. }) => *written,
                Err(_) => 0,
            };
            if let Some(armed) = &mut self.armed {
                armed.sent += written;
            }
            total += written;
            result?;
            if written != chunk.len() {
                return Err(LinkError::WriteTimeout { timeout, written, expected: chunk.len() });
            }
            writes += 1;
            trace!(len = written, "Pixel chunk written");
        }

        if let Some(armed) = self.armed {
            if armed.sent >= armed.rect.byte_len() {
                self.armed = None;
            }
        }
        Ok((total, writes))
    }

    async fn on_write_failure(&mut self, err: LinkError) -> LinkError {
        self.failure_count += 1;
        warn!(
            failures = self.failure_count,
            budget = self.failure_budget,
            code = err.reason_code(),
            "Display write failed"
        );

        if self.state == SessionState::Streaming {
            self.transition(SessionState::Degraded, Some(&err));
        }
        if self.state == SessionState::Degraded && self.failure_count > self.failure_budget {
            self.release().await;
            self.transition(SessionState::Recovering, Some(&err));
        }
        err
    }

    /// Set the backlight, now or as soon as the current window completes.
    ///
    /// The level is also kept for the setup of every later connection.
    pub async fn set_brightness(&mut self, percent: u8) -> Result<()> {
        if percent > 100 {
            return Err(LinkError::invalid_config("brightness", "must be 0 to 100"));
        }
        self.config.brightness = Some(percent);

        if !self.state.is_connected() {
            return Ok(());
        }
        if self.armed.is_some() {
            debug!(percent, "Brightness queued behind armed window");
            self.pending_brightness = Some(percent);
            return Ok(());
        }
        match self.send(&ProtocolCommand::SetBrightness(percent), self.config.write_timeout).await {
            Ok(_) => Ok(()),
            Err(err) if self.state == SessionState::Ready => Err(err),
            Err(err) => Err(self.on_write_failure(err).await),
        }
    }

    /// Check the link by draining any unsolicited device bytes.
    ///
    /// Replies are not interpreted. A read error closes the transport and
    /// moves a live session to `Recovering`.
    pub async fn poll_link(&mut self, timeout: Duration) -> Result<()> {
        if !self.state.is_connected() {
            return Ok(());
        }
        match self.transport.read(64, timeout).await {
            Ok(bytes) => {
                if !bytes.is_empty() {
                    trace!(len = bytes.len(), "Ignoring device bytes");
                }
                Ok(())
            }
            Err(err) => {
                self.recover(&err).await?;
                Err(err)
            }
        }
    }

    /// Close the link and enter `Recovering` because of `reason`.
    pub async fn recover(&mut self, reason: &LinkError) -> Result<()> {
        if !self.state.can_transition_to(SessionState::Recovering) {
            return Err(LinkError::InvalidTransition { state: self.state, action: "recover" });
        }
        self.release().await;
        self.transition(SessionState::Recovering, Some(reason));
        Ok(())
    }

    /// Close the link. Valid in every state.
    pub async fn disconnect(&mut self) {
        self.release().await;
        self.failure_count = 0;
        if self.state != SessionState::Disconnected {
            self.transition(SessionState::Disconnected, None);
        }
    }

    async fn release(&mut self) {
        self.armed = None;
        self.pending_brightness = None;
        if let Err(err) = self.transport.close().await {
            warn!(error = %err, "Failed to close transport");
        }
    }
}
