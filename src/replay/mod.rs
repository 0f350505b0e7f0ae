//! Offline replay of recorded display traffic.
//!
//! The [`ReplayAnalyzer`] runs the real [`Session`] against a
//! [`ScriptedTransport`] built from a [`Transcript`], and reports the state
//! trace and every byte where the session's output departs from the
//! recording. Two drivers are available:
//!
//! - [`ReplayAnalyzer::replay`] plans frames from caller-supplied bitmaps,
//!   exactly as the streaming controller would
//! - [`ReplayAnalyzer::replay_recorded`] rebuilds the frames from the
//!   transcript's own window and pixel bytes, a structural check that
//!   needs nothing but the file

mod scripted;
mod transcript;

pub use scripted::{Divergence, DivergenceKind, SCRIPTED_PORT, ScriptedTransport};
pub use transcript::{Direction, Transcript, TranscriptEntry, TranscriptSummary};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::Bitmap;
use crate::controller::FramePlanner;
use crate::protocol::{DeviceDecoder, DeviceEvent, Orientation, brightness_percent};
use crate::session::{Session, SessionConfig, SessionState, Transition};
use crate::types::{DeviceSelector, ErrorSnapshot, Frame, FrameKind, LinkParams};
use crate::{LinkError, Result};

/// Outcome of one replay run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayReport {
    /// Every session state change, in order
    pub transitions: Vec<Transition>,
    pub divergences: Vec<Divergence>,
    pub summary: TranscriptSummary,
    /// Why the session never reached streaming, if it didn't
    pub connect_error: Option<ErrorSnapshot>,
    pub frames_sent: usize,
    pub final_state: SessionState,
}

impl ReplayReport {
    pub fn passed(&self) -> bool {
        self.connect_error.is_none() && self.divergences.is_empty()
    }

    pub fn first_divergence(&self) -> Option<&Divergence> {
        self.divergences.first()
    }

    /// States visited, starting from `Disconnected`.
    pub fn states(&self) -> Vec<SessionState> {
        std::iter::once(SessionState::Disconnected).chain(self.transitions.iter().map(|t| t.to)).collect()
    }

    /// The first divergence as an error, for callers that want `?`.
    pub fn into_result(self) -> Result<Self> {
        if let Some(divergence) = self.divergences.first() {
            return Err(divergence.to_error());
        }
        Ok(self)
    }
}

/// One step of a recorded stream.
#[derive(Debug, Clone)]
enum Step {
    Frame(Frame),
    Brightness(u8),
}

/// Drives a [`Session`] over a [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct ReplayAnalyzer {
    config: SessionConfig,
    max_dirty_ratio: f64,
}

impl ReplayAnalyzer {
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, max_dirty_ratio: crate::controller::AdaptivePolicy::default().max_dirty_ratio })
    }

    /// Use a different full-frame threshold when planning bitmaps.
    pub fn with_max_dirty_ratio(mut self, ratio: f64) -> Self {
        self.max_dirty_ratio = ratio;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Replay `transcript` while streaming `bitmaps` through the frame
    /// planner, as the controller does.
    pub async fn replay<I>(&self, transcript: &Transcript, bitmaps: I) -> Result<ReplayReport>
    where
        I: IntoIterator<Item = Bitmap>,
    {
        let mut planner = FramePlanner::new(self.config.panel_width, self.config.panel_height, self.max_dirty_ratio);
        let mut frames = Vec::new();
        for bitmap in bitmaps {
            if let Some(frame) = planner.plan(&bitmap)? {
                frames.push(Step::Frame(frame));
            }
            planner.commit(bitmap);
        }
        self.run(transcript, self.config.clone(), frames).await
    }

    /// Replay `transcript` using the frames it carries itself.
    pub async fn replay_recorded(&self, transcript: &Transcript) -> Result<ReplayReport> {
        let (config, steps) = self.recorded_steps(transcript)?;
        self.run(transcript, config, steps).await
    }

    /// Split the host stream into setup settings and streaming steps.
    fn recorded_steps(&self, transcript: &Transcript) -> Result<(SessionConfig, Vec<Step>)> {
        let mut config = self.config.clone();
        config.brightness = None;
        let full = config.full_rect();

        let mut decoder = DeviceDecoder::new();
        let mut steps = Vec::new();
        let mut pixels: Vec<u8> = Vec::new();
        let mut seen_window = false;

        for entry in transcript.entries().iter().filter(|e| e.is_host()) {
            for event in decoder.feed(&entry.payload) {
                match event {
                    DeviceEvent::Orientation(code) if !seen_window => {
                        if let Some(orientation) = Orientation::from_code(code) {
                            config.orientation = orientation;
                        }
                    }
                    DeviceEvent::Brightness(level) if !seen_window => {
                        config.brightness = Some(brightness_percent(level));
                    }
                    DeviceEvent::Brightness(level) => steps.push(Step::Brightness(brightness_percent(level))),
                    DeviceEvent::Window(rect) => {
                        seen_window = true;
                        pixels = Vec::with_capacity(rect.byte_len());
                    }
                    DeviceEvent::Pixels { bytes, .. } => pixels.extend_from_slice(&bytes),
                    DeviceEvent::FrameComplete(rect) => {
                        let kind = if rect == full { FrameKind::Full } else { FrameKind::Dirty };
                        let frame = Frame::new(rect, kind, std::mem::take(&mut pixels))
                            .map_err(|err| LinkError::malformed_transcript(entry.line, err.to_string()))?;
                        steps.push(Step::Frame(frame));
                    }
                    DeviceEvent::Hello | DeviceEvent::Orientation(_) | DeviceEvent::Unknown(_) => {}
                }
            }
        }

        if let Some(rect) = decoder.pending_window() {
            debug!(window = ?rect, "Transcript ends inside a window");
        }
        config.validate()?;
        Ok((config, steps))
    }

    async fn run(&self, transcript: &Transcript, config: SessionConfig, steps: Vec<Step>) -> Result<ReplayReport> {
        let summary = transcript.summary();
        let mut session = Session::new(ScriptedTransport::new(transcript), config)?.with_trace();
        info!(entries = transcript.len(), steps = steps.len(), "Replaying transcript");

        let mut connect_error = None;
        let mut frames_sent = 0;
        match session.connect(&DeviceSelector::default(), &LinkParams::default()).await {
            Ok(()) => {
                session.begin_streaming()?;
                for step in &steps {
                    let result = match step {
                        Step::Frame(frame) => session.send_frame(frame).await.map(|_| frames_sent += 1),
                        Step::Brightness(percent) => session.set_brightness(*percent).await,
                    };
                    if let Err(err) = result {
                        warn!(error = %err, "Replay step failed");
                        if !matches!(session.state(), SessionState::Streaming | SessionState::Degraded) {
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "Replay never reached streaming");
                connect_error = Some(ErrorSnapshot::from(&err));
            }
        }

        let final_state = session.state();
        let transitions = session.transitions().to_vec();
        session.disconnect().await;
        let divergences = session.into_transport().finish();

        let report = ReplayReport { transitions, divergences, summary, connect_error, frames_sent, final_state };
        info!(
            passed = report.passed(),
            divergences = report.divergences.len(),
            frames = report.frames_sent,
            "Replay finished"
        );
        Ok(report)
    }
}
