//! JSON Lines transcripts of display traffic.
//!
//! One object per line:
//!
//! ```text
//! {"dir":"host_to_device","t_ms":0.0,"payload_hex":"454545454545"}
//! {"dir":"device_to_host","t_ms":1.5,"payload_hex":"020202020202"}
//! ```
//!
//! `dir` also accepts `direction`, and the values `tx`/`h2d` and `rx`/`d2h`.
//! The timestamp may be named `t_ms`, `ts_ms` or `timestamp_ms`. Payloads
//! are hex (`payload_hex`, `hex` or `hex_preview`, separators ignored) or base64
//! (`payload_b64` or `base64`). Blank lines are skipped.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocol::{DeviceDecoder, DeviceEvent};
use crate::{LinkError, Result};

/// Which way a payload travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "host_to_device", alias = "tx", alias = "h2d")]
    HostToDevice,
    #[serde(rename = "device_to_host", alias = "rx", alias = "d2h")]
    DeviceToHost,
}

/// One captured transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub direction: Direction,
    /// Time since the first entry
    pub offset: Duration,
    pub payload: Vec<u8>,
    /// Source line number, 0 for entries built in memory
    pub line: usize,
}

impl TranscriptEntry {
    pub fn host(offset: Duration, payload: impl Into<Vec<u8>>) -> Self {
        Self { direction: Direction::HostToDevice, offset, payload: payload.into(), line: 0 }
    }

    pub fn device(offset: Duration, payload: impl Into<Vec<u8>>) -> Self {
        Self { direction: Direction::DeviceToHost, offset, payload: payload.into(), line: 0 }
    }

    pub fn is_host(&self) -> bool {
        self.direction == Direction::HostToDevice
    }
}

#[derive(Deserialize)]
struct RawEntry {
    #[serde(alias = "direction")]
    dir: Direction,
    #[serde(default, alias = "ts_ms", alias = "timestamp_ms")]
    t_ms: Option<f64>,
    #[serde(default, alias = "hex")]
    payload_hex: Option<String>,
    /// Capture tools may only write a preview column
    #[serde(default)]
    hex_preview: Option<String>,
    #[serde(default, alias = "base64")]
    payload_b64: Option<String>,
}

#[derive(Serialize)]
struct RawEntryOut {
    dir: Direction,
    t_ms: f64,
    payload_hex: String,
}

/// An ordered sequence of entries with non-decreasing offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from in-memory entries, checking their ordering.
    pub fn from_entries(entries: Vec<TranscriptEntry>) -> Result<Self> {
        let mut transcript = Self::new();
        for entry in entries {
            transcript.push(entry)?;
        }
        Ok(transcript)
    }

    /// Append an entry. Its offset may not precede the last one.
    pub fn push(&mut self, entry: TranscriptEntry) -> Result<()> {
        if let Some(last) = self.entries.last() {
            if entry.offset < last.offset {
                return Err(LinkError::malformed_transcript(
                    entry.line.max(self.entries.len() + 1),
                    format!("timestamp {:?} precedes {:?}", entry.offset, last.offset),
                ));
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Parse JSON Lines text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut transcript = Self::new();
        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            transcript.push(parse_line(line_no, trimmed)?)?;
        }
        debug!(entries = transcript.len(), "Parsed transcript");
        Ok(transcript)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| LinkError::TranscriptFile { path: path.to_path_buf(), source })?;
        Self::parse(&text)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_jsonl())
            .map_err(|source| LinkError::TranscriptFile { path: path.to_path_buf(), source })
    }

    /// Render as JSON Lines with hex payloads.
    pub fn to_jsonl(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let raw = RawEntryOut {
                dir: entry.direction,
                t_ms: entry.offset.as_secs_f64() * 1000.0,
                payload_hex: hex::encode(&entry.payload),
            };
            // Serializing plain strings and numbers cannot fail
            if let Ok(json) = serde_json::to_string(&raw) {
                let _ = writeln!(out, "{json}");
            }
        }
        out
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// Mutable access to payloads, for building divergent fixtures.
    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut TranscriptEntry> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset of the last entry.
    pub fn duration(&self) -> Duration {
        self.entries.last().map(|e| e.offset).unwrap_or_default()
    }

    /// Structural counts over the host-to-device stream.
    pub fn summary(&self) -> TranscriptSummary {
        let mut summary = TranscriptSummary { entries: self.entries.len(), ..TranscriptSummary::default() };
        let mut decoder = DeviceDecoder::new();

        for entry in &self.entries {
            match entry.direction {
                Direction::DeviceToHost => {
                    summary.device_entries += 1;
                    summary.device_bytes += entry.payload.len() as u64;
                    continue;
                }
                Direction::HostToDevice => {
                    summary.host_entries += 1;
                    summary.host_bytes += entry.payload.len() as u64;
                }
            }

            let mut carried_pixels = false;
            for event in decoder.feed(&entry.payload) {
                match event {
                    DeviceEvent::Hello => summary.hello_count += 1,
                    DeviceEvent::Orientation(_) => summary.orientation_count += 1,
                    DeviceEvent::Brightness(_) => summary.brightness_count += 1,
                    DeviceEvent::Window(_) => summary.window_count += 1,
                    DeviceEvent::Pixels { bytes, .. } => {
                        carried_pixels = true;
                        summary.pixel_bytes += bytes.len() as u64;
                    }
                    DeviceEvent::FrameComplete(_) => summary.frames_completed += 1,
                    DeviceEvent::Unknown(_) => summary.unknown_bytes += 1,
                }
            }
            if carried_pixels {
                summary.payload_packets += 1;
            }
        }

        summary
    }
}

fn parse_line(line: usize, text: &str) -> Result<TranscriptEntry> {
    let raw: RawEntry =
        serde_json::from_str(text).map_err(|e| LinkError::malformed_transcript(line, e.to_string()))?;

    let t_ms = raw.t_ms.ok_or_else(|| LinkError::malformed_transcript(line, "missing timestamp"))?;
    if !t_ms.is_finite() || t_ms < 0.0 {
        return Err(LinkError::malformed_transcript(line, format!("invalid timestamp {t_ms}")));
    }

    let payload = match (raw.payload_hex.or(raw.hex_preview), raw.payload_b64) {
        (Some(hex_text), _) => decode_hex(line, &hex_text)?,
        (None, Some(b64)) => base64::engine::general_purpose::STANDARD
            .decode(b64.trim())
            .map_err(|e| LinkError::malformed_transcript(line, format!("invalid base64: {e}")))?,
        (None, None) => return Err(LinkError::malformed_transcript(line, "missing payload")),
    };

    Ok(TranscriptEntry { direction: raw.dir, offset: Duration::from_secs_f64(t_ms / 1000.0), payload, line })
}

/// Decode hex, ignoring whitespace and `:`/`-` separators.
fn decode_hex(line: usize, text: &str) -> Result<Vec<u8>> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace() && *c != ':' && *c != '-').collect();
    hex::decode(&cleaned).map_err(|e| LinkError::malformed_transcript(line, format!("invalid hex: {e}")))
}

/// Counts over a transcript, plus the strict structural checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TranscriptSummary {
    pub entries: usize,
    pub host_entries: usize,
    pub device_entries: usize,
    pub host_bytes: u64,
    pub device_bytes: u64,
    pub hello_count: usize,
    pub orientation_count: usize,
    pub brightness_count: usize,
    pub window_count: usize,
    /// Host entries that carried pixel bytes
    pub payload_packets: usize,
    pub pixel_bytes: u64,
    pub frames_completed: usize,
    pub unknown_bytes: usize,
}

impl TranscriptSummary {
    /// Codes for every missing part of a well-formed session.
    pub fn strict_errors(&self) -> Vec<&'static str> {
        let mut errors = Vec::new();
        if self.hello_count == 0 {
            errors.push("missing_hello");
        }
        if self.orientation_count == 0 {
            errors.push("missing_orientation");
        }
        if self.window_count == 0 {
            errors.push("missing_window");
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
{"dir":"host_to_device","t_ms":0,"payload_hex":"45 45 45 45 45 45"}
{"direction":"rx","ts_ms":2.5,"hex":"02:02:02:02:02:02"}

{"dir":"tx","timestamp_ms":3,"payload_b64":"eQI="}
{"dir":"h2d","t_ms":3,"payload_hex":"C50000000001000100"}
{"dir":"h2d","t_ms":4,"payload_hex":"ffff"}
"#;

    #[test]
    fn parses_every_alias() {
        let transcript = Transcript::parse(SAMPLE).unwrap();
        assert_eq!(transcript.len(), 5);
        let entries = transcript.entries();
        assert_eq!(entries[0].payload, vec![0x45; 6]);
        assert_eq!(entries[0].line, 2);
        assert_eq!(entries[1].direction, Direction::DeviceToHost);
        assert_eq!(entries[1].offset, Duration::from_micros(2500));
        assert_eq!(entries[2].payload, vec![0x79, 0x02]);
        assert_eq!(entries[2].line, 5);
    }

    #[test]
    fn hex_preview_is_a_payload_fallback() {
        let text = concat!(
            r#"{"direction":"tx","ts_ms":0,"hex_preview":"45 45 45 45 45 45"}"#,
            "\n",
            r#"{"direction":"rx","ts_ms":1,"payload_hex":"0303","hex_preview":"ffff"}"#,
            "\n",
        );
        let transcript = Transcript::parse(text).unwrap();
        assert_eq!(transcript.entries()[0].payload, vec![0x45; 6]);
        assert_eq!(transcript.entries()[1].payload, vec![0x03, 0x03]);
    }

    #[test]
    fn summary_counts_commands() {
        let summary = Transcript::parse(SAMPLE).unwrap().summary();
        assert_eq!(summary.hello_count, 1);
        assert_eq!(summary.orientation_count, 1);
        assert_eq!(summary.window_count, 1);
        assert_eq!(summary.payload_packets, 1);
        assert_eq!(summary.pixel_bytes, 2);
        assert_eq!(summary.frames_completed, 1);
        assert_eq!(summary.device_bytes, 6);
        assert!(summary.strict_errors().is_empty());
    }

    #[test]
    fn strict_checks_name_missing_parts() {
        let transcript = Transcript::parse(r#"{"dir":"tx","t_ms":0,"hex":"454545454545"}"#).unwrap();
        assert_eq!(transcript.summary().strict_errors(), vec!["missing_orientation", "missing_window"]);
    }

    #[test]
    fn decreasing_timestamp_is_malformed() {
        let text = "{\"dir\":\"tx\",\"t_ms\":5,\"hex\":\"00\"}\n{\"dir\":\"tx\",\"t_ms\":4,\"hex\":\"00\"}";
        match Transcript::parse(text) {
            Err(LinkError::MalformedTranscript { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected MalformedTranscript, got {other:?}"),
        }
    }

    #[test]
    fn bad_lines_report_their_line_number() {
        for text in [
            "{\"dir\":\"tx\",\"t_ms\":0,\"hex\":\"00\"}\nnot json",
            "{\"dir\":\"tx\",\"t_ms\":0,\"hex\":\"00\"}\n{\"dir\":\"tx\",\"t_ms\":-1,\"hex\":\"00\"}",
            "{\"dir\":\"tx\",\"t_ms\":0,\"hex\":\"00\"}\n{\"dir\":\"tx\",\"hex\":\"00\"}",
            "{\"dir\":\"tx\",\"t_ms\":0,\"hex\":\"00\"}\n{\"dir\":\"tx\",\"t_ms\":1,\"hex\":\"0\"}",
            "{\"dir\":\"tx\",\"t_ms\":0,\"hex\":\"00\"}\n{\"dir\":\"sideways\",\"t_ms\":1,\"hex\":\"00\"}",
        ] {
            assert!(
                matches!(Transcript::parse(text), Err(LinkError::MalformedTranscript { line: 2, .. })),
                "{text}"
            );
        }
    }

    #[test]
    fn jsonl_output_parses_back() {
        let transcript = Transcript::parse(SAMPLE).unwrap();
        let reparsed = Transcript::parse(&transcript.to_jsonl()).unwrap();
        let payloads: Vec<_> = reparsed.entries().iter().map(|e| e.payload.clone()).collect();
        let expected: Vec<_> = transcript.entries().iter().map(|e| e.payload.clone()).collect();
        assert_eq!(payloads, expected);
    }
}
