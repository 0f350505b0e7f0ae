//! Error types for the display link.
//!
//! Every failure the link can produce is a variant of [`LinkError`]. The
//! taxonomy follows where a failure originates:
//!
//! - **Open-time**: [`LinkError::DeviceNotFound`], [`LinkError::PermissionDenied`],
//!   [`LinkError::PortBusy`]. These need operator action before a retry helps.
//! - **Handshake**: [`LinkError::HandshakeTimeout`], [`LinkError::HandshakeRejected`].
//!   They fail the connect attempt and feed the recovery backoff loop.
//! - **Mid-stream**: [`LinkError::WriteTimeout`], [`LinkError::LinkLost`]. These
//!   drive the Degraded → Recovering escalation.
//! - **Replay**: [`LinkError::MalformedTranscript`], [`LinkError::TranscriptDivergence`],
//!   [`LinkError::TranscriptFile`].
//! - **Caller**: [`LinkError::InvalidConfig`], [`LinkError::InvalidFrame`],
//!   [`LinkError::InvalidTransition`]. Reported synchronously to whoever
//!   introduced the bad value.
//!
//! ```rust
//! use smartscreen::LinkError;
//!
//! let error = LinkError::link_lost("cable unplugged");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! assert_eq!(error.reason_code(), "link_lost");
//! ```

use std::time::Duration;
use thiserror::Error;

use crate::session::SessionState;

/// Result type alias for link operations.
pub type Result<T, E = LinkError> = std::result::Result<T, E>;

/// Main error type for the display link.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LinkError {
    #[error("No display found matching {target}")]
    DeviceNotFound { target: String },

    #[error("Permission denied opening {port}")]
    PermissionDenied {
        port: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Port {port} is already held by another session")]
    PortBusy { port: String },

    #[error("Display did not answer HELLO within {timeout:?}")]
    HandshakeTimeout { timeout: Duration },

    #[error("Display rejected HELLO (reply {reply})")]
    HandshakeRejected { reply: String },

    #[error("Write timed out after {timeout:?} ({written}/{expected} bytes written)")]
    WriteTimeout { timeout: Duration, written: usize, expected: usize },

    #[error("Serial link lost: {reason}")]
    LinkLost {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Malformed transcript at line {line}: {reason}")]
    MalformedTranscript { line: usize, reason: String },

    #[error("Transcript diverged at entry {entry}, byte offset {offset}")]
    TranscriptDivergence { entry: usize, offset: usize },

    #[error("Cannot access transcript {}", .path.display())]
    TranscriptFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration for '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Invalid frame: {details}")]
    InvalidFrame { details: String },

    #[error("Cannot {action} while {state}")]
    InvalidTransition { state: SessionState, action: &'static str },
}

impl LinkError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            LinkError::DeviceNotFound { .. } => false,
            LinkError::PermissionDenied { .. } => false,
            LinkError::PortBusy { .. } => false,
            LinkError::HandshakeTimeout { .. } => true,
            LinkError::HandshakeRejected { .. } => true,
            LinkError::WriteTimeout { .. } => true,
            LinkError::LinkLost { .. } => true,
            LinkError::MalformedTranscript { .. } => false,
            LinkError::TranscriptDivergence { .. } => false,
            LinkError::TranscriptFile { .. } => false,
            LinkError::InvalidConfig { .. } => false,
            LinkError::InvalidFrame { .. } => false,
            LinkError::InvalidTransition { .. } => false,
        }
    }

    /// Stable machine-readable code, used in status snapshots.
    pub fn reason_code(&self) -> &'static str {
        match self {
            LinkError::DeviceNotFound { .. } => "device_not_found",
            LinkError::PermissionDenied { .. } => "permission_denied",
            LinkError::PortBusy { .. } => "port_busy",
            LinkError::HandshakeTimeout { .. } => "handshake_timeout",
            LinkError::HandshakeRejected { .. } => "handshake_rejected",
            LinkError::WriteTimeout { .. } => "write_timeout",
            LinkError::LinkLost { .. } => "link_lost",
            LinkError::MalformedTranscript { .. } => "malformed_transcript",
            LinkError::TranscriptDivergence { .. } => "transcript_divergence",
            LinkError::TranscriptFile { .. } => "transcript_file",
            LinkError::InvalidConfig { .. } => "invalid_config",
            LinkError::InvalidFrame { .. } => "invalid_frame",
            LinkError::InvalidTransition { .. } => "invalid_transition",
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            LinkError::DeviceNotFound { .. } => vec![
                "Check the USB cable is connected",
                "Verify the display enumerates as 1A86:5722",
                "Set an explicit port override",
            ],
            LinkError::PermissionDenied { .. } => vec![
                "Add the user to the dialout/uucp group",
                "Check udev rules for the serial device",
            ],
            LinkError::PortBusy { .. } => vec![
                "Close other applications using the display",
                "Disconnect the existing session first",
            ],
            LinkError::HandshakeTimeout { .. } => vec![
                "Increase the handshake timeout",
                "Power-cycle the display",
                "Enable lenient HELLO for legacy units",
            ],
            LinkError::HandshakeRejected { .. } => vec![
                "Verify the display is a revision A unit",
                "Power-cycle the display",
            ],
            LinkError::WriteTimeout { .. } => vec![
                "Lower the target frame rate",
                "Increase the write timeout",
                "Check for a saturated USB hub",
            ],
            LinkError::LinkLost { .. } => {
                vec!["Check the USB cable", "Wait for automatic reconnection"]
            }
            LinkError::MalformedTranscript { .. } => vec![
                "Check each line is a JSON object",
                "Ensure timestamps are non-decreasing",
            ],
            LinkError::TranscriptDivergence { .. } => vec![
                "Compare the byte diff against the protocol changes",
                "Re-record the transcript if the change is intended",
            ],
            LinkError::TranscriptFile { .. } => {
                vec!["Check the transcript path exists and is readable"]
            }
            LinkError::InvalidConfig { .. } => vec!["Fix the reported configuration field"],
            LinkError::InvalidFrame { .. } => vec!["Supply bitmaps at the panel resolution"],
            LinkError::InvalidTransition { .. } => {
                vec!["Check the session state before issuing the call"]
            }
        }
    }

    /// Helper constructor for link loss without an underlying source.
    pub fn link_lost(reason: impl Into<String>) -> Self {
        LinkError::LinkLost { reason: reason.into(), source: None }
    }

    /// Helper constructor for link loss caused by an I/O failure.
    pub fn link_lost_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        LinkError::LinkLost { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for configuration errors.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        LinkError::InvalidConfig { field: field.into(), reason: reason.into() }
    }

    /// Helper constructor for frame construction errors.
    pub fn invalid_frame(details: impl Into<String>) -> Self {
        LinkError::InvalidFrame { details: details.into() }
    }

    /// Helper constructor for transcript parse errors.
    pub fn malformed_transcript(line: usize, reason: impl Into<String>) -> Self {
        LinkError::MalformedTranscript { line, reason: reason.into() }
    }

    /// Map a serialport open failure onto the open-time taxonomy.
    pub fn from_open_error(port: &str, err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => {
                LinkError::DeviceNotFound { target: port.to_string() }
            }
            serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                LinkError::DeviceNotFound { target: port.to_string() }
            }
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                LinkError::PermissionDenied { port: port.to_string(), source: Some(Box::new(err)) }
            }
            serialport::ErrorKind::Io(std::io::ErrorKind::ResourceBusy) => {
                LinkError::PortBusy { port: port.to_string() }
            }
            _ => LinkError::link_lost_with_source(format!("failed to open {port}"), Box::new(err)),
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::link_lost_with_source(err.to_string(), Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn error_messages_carry_their_context(
                port in "[a-zA-Z0-9/]+",
                reason in ".*",
                line in 1usize..10_000,
                offset in 0usize..0x10000,
                timeout_ms in 1u64..60_000,
            ) {
                let busy = LinkError::PortBusy { port: port.clone() };
                prop_assert!(busy.to_string().contains(&port));

                let lost = LinkError::link_lost(reason.clone());
                prop_assert!(lost.to_string().contains(&reason));

                let malformed = LinkError::malformed_transcript(line, reason.clone());
                prop_assert!(malformed.to_string().contains(&line.to_string()));

                let divergence = LinkError::TranscriptDivergence { entry: line, offset };
                prop_assert!(divergence.to_string().contains(&offset.to_string()));

                let timeout = LinkError::HandshakeTimeout {
                    timeout: Duration::from_millis(timeout_ms),
                };
                prop_assert!(!timeout.to_string().is_empty());
            }
        }
    }

    #[test]
    fn open_time_errors_are_not_retryable() {
        assert!(!LinkError::DeviceNotFound { target: "1A86:5722".into() }.is_retryable());
        assert!(!LinkError::PermissionDenied { port: "/dev/ttyACM0".into(), source: None }
            .is_retryable());
        assert!(!LinkError::PortBusy { port: "/dev/ttyACM0".into() }.is_retryable());
    }

    #[test]
    fn link_errors_feed_recovery() {
        assert!(LinkError::link_lost("unplugged").is_retryable());
        assert!(
            LinkError::WriteTimeout { timeout: Duration::from_millis(5), written: 3, expected: 9 }
                .is_retryable()
        );
        assert!(LinkError::HandshakeTimeout { timeout: Duration::from_millis(500) }.is_retryable());
    }

    #[test]
    fn every_error_has_suggestions_and_code() {
        let errors = vec![
            LinkError::DeviceNotFound { target: "x".into() },
            LinkError::HandshakeRejected { reply: "ff".into() },
            LinkError::malformed_transcript(3, "bad json"),
            LinkError::invalid_config("budget.frame_interval", "must be non-zero"),
            LinkError::InvalidTransition { state: SessionState::Streaming, action: "connect" },
        ];
        for error in errors {
            assert!(!error.recovery_suggestions().is_empty());
            assert!(!error.reason_code().is_empty());
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<LinkError>();
    }

    #[test]
    fn io_errors_become_link_lost() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: LinkError = io.into();
        assert!(matches!(err, LinkError::LinkLost { .. }));
        assert!(std::error::Error::source(&err).is_some());
    }
}
