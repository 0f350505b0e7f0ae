//! Transport that plays a transcript back at a session

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::transcript::{Direction, Transcript};
use crate::transport::Transport;
use crate::types::{DeviceDescriptor, DeviceSelector, LinkParams, PRODUCT_ID, VENDOR_ID};
use crate::{LinkError, Result};

/// Port name reported for scripted sessions.
pub const SCRIPTED_PORT: &str = "replay://transcript";

/// Bytes of context kept on each side of a divergence.
const DIFF_CONTEXT: usize = 16;

/// How the written bytes departed from the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    /// A byte differs from the recorded one
    Mismatch,
    /// Bytes written after the transcript's host stream ended
    Unexpected,
    /// Recorded host bytes that were never written
    Missing,
}

/// One departure from the recorded host stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    /// Index of the transcript entry
    pub entry: usize,
    /// Source line of that entry, 0 if built in memory
    pub line: usize,
    /// Byte offset inside the entry's payload
    pub offset: usize,
    pub kind: DivergenceKind,
    #[serde(serialize_with = "hex::serde::serialize")]
    pub expected: Vec<u8>,
    #[serde(serialize_with = "hex::serde::serialize")]
    pub actual: Vec<u8>,
}

impl Divergence {
    pub fn to_error(&self) -> LinkError {
        LinkError::TranscriptDivergence { entry: self.entry, offset: self.offset }
    }
}

#[derive(Debug)]
struct Expected {
    entry: usize,
    line: usize,
    payload: Vec<u8>,
}

/// Scripted [`Transport`] fed by a [`Transcript`].
///
/// Writes are compared byte by byte against the concatenated host-to-device
/// payloads, so chunking may differ from the recording. Every departure is
/// recorded and the comparison carries on; at most one divergence is kept
/// per entry. Reads hand out device-to-host payloads in order, each only
/// once every host entry recorded before it has been written. Time is
/// logical: nothing sleeps, an empty read is an immediate timeout.
#[derive(Debug)]
pub struct ScriptedTransport {
    host: Vec<Expected>,
    device: Vec<(usize, Vec<u8>)>,
    host_index: usize,
    host_offset: usize,
    device_index: usize,
    device_offset: usize,
    total_entries: usize,
    overflow: usize,
    diverged_entries: Vec<usize>,
    divergences: Vec<Divergence>,
    opens: u32,
    open: bool,
}

impl ScriptedTransport {
    pub fn new(transcript: &Transcript) -> Self {
        let mut host = Vec::new();
        let mut device = Vec::new();
        for (index, entry) in transcript.entries().iter().enumerate() {
            match entry.direction {
                Direction::HostToDevice => {
                    if !entry.payload.is_empty() {
                        host.push(Expected { entry: index, line: entry.line, payload: entry.payload.clone() });
                    }
                }
                Direction::DeviceToHost => device.push((index, entry.payload.clone())),
            }
        }

        Self {
            host,
            device,
            host_index: 0,
            host_offset: 0,
            device_index: 0,
            device_offset: 0,
            total_entries: transcript.len(),
            overflow: 0,
            diverged_entries: Vec::new(),
            divergences: Vec::new(),
            opens: 0,
            open: false,
        }
    }

    /// Divergences recorded so far.
    pub fn divergences(&self) -> &[Divergence] {
        &self.divergences
    }

    /// Host bytes still expected.
    pub fn remaining_host_bytes(&self) -> usize {
        self.host[self.host_index.min(self.host.len())..].iter().map(|e| e.payload.len()).sum::<usize>()
            - self.host_offset
    }

    pub fn open_count(&self) -> u32 {
        self.opens
    }

    /// Stop the script: any host bytes never written become a `Missing`
    /// divergence. Returns every divergence.
    pub fn finish(mut self) -> Vec<Divergence> {
        if let Some(expected) = self.host.get(self.host_index) {
            let offset = self.host_offset;
            let end = (offset + DIFF_CONTEXT).min(expected.payload.len());
            let divergence = Divergence {
                entry: expected.entry,
                line: expected.line,
                offset,
                kind: DivergenceKind::Missing,
                expected: expected.payload[offset..end].to_vec(),
                actual: Vec::new(),
            };
            warn!(entry = divergence.entry, offset, remaining = self.remaining_host_bytes(), "Transcript not fully replayed");
            self.divergences.push(divergence);
        }
        self.divergences
    }

    fn compare(&mut self, bytes: &[u8]) {
        let mut position = 0;
        while position < bytes.len() {
            let Some(expected) = self.host.get(self.host_index) else {
                self.record_overflow(&bytes[position..]);
                return;
            };

            let available = expected.payload.len() - self.host_offset;
            let take = available.min(bytes.len() - position);
            let wanted = &expected.payload[self.host_offset..self.host_offset + take];
            let written = &bytes[position..position + take];

            if let Some(at) = wanted.iter().zip(written).position(|(a, b)| a != b) {
                if !self.diverged_entries.contains(&expected.entry) {
                    let offset = self.host_offset + at;
                    let divergence = Divergence {
                        entry: expected.entry,
                        line: expected.line,
                        offset,
                        kind: DivergenceKind::Mismatch,
                        expected: expected.payload[offset..(offset + DIFF_CONTEXT).min(expected.payload.len())].to_vec(),
                        actual: written[at..(at + DIFF_CONTEXT).min(written.len())].to_vec(),
                    };
                    warn!(
                        entry = divergence.entry,
                        offset,
                        expected = %hex::encode(&divergence.expected),
                        actual = %hex::encode(&divergence.actual),
                        "Replay diverged"
                    );
                    self.diverged_entries.push(divergence.entry);
                    self.divergences.push(divergence);
                }
            }

            position += take;
            self.host_offset += take;
            if self.host_offset == expected.payload.len() {
                self.host_index += 1;
                self.host_offset = 0;
            }
        }
    }

    fn record_overflow(&mut self, extra: &[u8]) {
        if self.overflow == 0 {
            warn!(len = extra.len(), "Write past the end of the transcript");
            self.divergences.push(Divergence {
                entry: self.total_entries,
                line: 0,
                offset: 0,
                kind: DivergenceKind::Unexpected,
                expected: Vec::new(),
                actual: extra[..extra.len().min(DIFF_CONTEXT)].to_vec(),
            });
        }
        self.overflow += extra.len();
    }

    /// Whether every host entry recorded before `entry` has been written.
    fn host_caught_up_to(&self, entry: usize) -> bool {
        self.host.get(self.host_index).is_none_or(|next| next.entry > entry)
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn resolve(&mut self, _selector: &DeviceSelector, link: &LinkParams) -> Result<DeviceDescriptor> {
        Ok(DeviceDescriptor {
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
            port: SCRIPTED_PORT.to_string(),
            link: link.clone(),
        })
    }

    async fn open(&mut self, _descriptor: &DeviceDescriptor) -> Result<()> {
        self.opens += 1;
        self.open = true;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8], _timeout: Duration) -> Result<usize> {
        if !self.open {
            return Err(LinkError::link_lost("scripted port is not open"));
        }
        self.compare(bytes);
        Ok(bytes.len())
    }

    async fn read(&mut self, max: usize, _timeout: Duration) -> Result<Vec<u8>> {
        if !self.open {
            return Err(LinkError::link_lost("scripted port is not open"));
        }
        let Some((entry, payload)) = self.device.get(self.device_index) else {
            return Ok(Vec::new());
        };
        if !self.host_caught_up_to(*entry) {
            return Ok(Vec::new());
        }

        let end = (self.device_offset + max).min(payload.len());
        let chunk = payload[self.device_offset..end].to_vec();
        debug!(entry = *entry, len = chunk.len(), "Replaying device bytes");
        self.device_offset = end;
        if self.device_offset == payload.len() {
            self.device_index += 1;
            self.device_offset = 0;
        }
        Ok(chunk)
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
