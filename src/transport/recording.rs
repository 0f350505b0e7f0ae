//! Transcript capture around any transport

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use super::Transport;
use crate::{LinkError, Result};
use crate::replay::{Transcript, TranscriptEntry};
use crate::types::{DeviceDescriptor, DeviceSelector, LinkParams};

/// Shared handle to the entries captured by a [`RecordingTransport`].
#[derive(Clone, Default)]
pub struct TranscriptRecorder {
    inner: Arc<Mutex<Recorded>>,
}

#[derive(Default)]
struct Recorded {
    started: Option<Instant>,
    entries: Vec<TranscriptEntry>,
}

impl TranscriptRecorder {
    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, make: impl FnOnce(Duration) -> TranscriptEntry) {
        let mut recorded = self.lock();
        let now = Instant::now();
        let started = *recorded.started.get_or_insert(now);
        let entry = make(now.saturating_duration_since(started));
        recorded.entries.push(entry);
    }

    /// Entries captured so far.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Copy of everything captured so far.
    pub fn transcript(&self) -> Transcript {
        let entries = self.lock().entries.clone();
        // Offsets come from a monotonic clock, so ordering always holds
        Transcript::from_entries(entries).unwrap_or_default()
    }
}

/// Passes every call through to `inner`, recording host writes and
/// non-empty device reads.
pub struct RecordingTransport<T> {
    inner: T,
    recorder: TranscriptRecorder,
}

impl<T: Transport> RecordingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self { inner, recorder: TranscriptRecorder::default() }
    }

    pub fn recorder(&self) -> TranscriptRecorder {
        self.recorder.clone()
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait::async_trait]
impl<T: Transport> Transport for RecordingTransport<T> {
    async fn resolve(&mut self, selector: &DeviceSelector, link: &LinkParams) -> Result<DeviceDescriptor> {
        self.inner.resolve(selector, link).await
    }

    async fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<()> {
        self.inner.open(descriptor).await
    }

    async fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize> {
        let result = self.inner.write(bytes, timeout).await;
        // Bytes that reached the port before a timeout are part of the session
        let written = match &result {
            Ok(written) => *written,
            Err(LinkError::WriteTimeout { written, .. }) => *written,
            Err(_) => 0,
        };
        if written > 0 {
            let written = written.min(bytes.len());
            self.recorder.record(|offset| TranscriptEntry::host(offset, &bytes[..written]));
        }
        result
    }

    async fn read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        let bytes = self.inner.read(max, timeout).await?;
        if !bytes.is_empty() {
            self.recorder.record(|offset| TranscriptEntry::device(offset, bytes.clone()));
        }
        Ok(bytes)
    }

    async fn discard_input(&mut self) -> Result<()> {
        self.inner.discard_input().await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolCommand;
    use crate::replay::Direction;
    use crate::transport::{SimulatedDevice, WriteFault};

    #[tokio::test(start_paused = true)]
    async fn records_writes_and_replies() {
        let device = SimulatedDevice::new(8, 4);
        let mut transport = RecordingTransport::new(device.transport());
        let recorder = transport.recorder();
        let t = Duration::from_millis(20);

        let descriptor = transport.resolve(&DeviceSelector::default(), &LinkParams::default()).await.unwrap();
        transport.open(&descriptor).await.unwrap();
        transport.write(&ProtocolCommand::Hello.encode(), t).await.unwrap();
        tokio::time::advance(Duration::from_millis(3)).await;
        transport.read(6, t).await.unwrap();
        transport.read(6, t).await.unwrap();

        let transcript = recorder.transcript();
        assert_eq!(transcript.len(), 2);
        let entries = transcript.entries();
        assert_eq!(entries[0].direction, Direction::HostToDevice);
        assert_eq!(entries[0].payload, vec![0x45; 6]);
        assert_eq!(entries[1].direction, Direction::DeviceToHost);
        assert_eq!(entries[1].offset, Duration::from_millis(3));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_writes_keep_the_bytes_that_went_out() {
        let device = SimulatedDevice::new(8, 4);
        let mut transport = RecordingTransport::new(device.transport());
        let recorder = transport.recorder();
        let t = Duration::from_millis(5);

        let descriptor = transport.resolve(&DeviceSelector::default(), &LinkParams::default()).await.unwrap();
        transport.open(&descriptor).await.unwrap();

        device.fail_next_writes(1, WriteFault::Partial(3));
        let err = transport.write(&ProtocolCommand::Hello.encode(), t).await.unwrap_err();
        assert!(matches!(err, LinkError::WriteTimeout { written: 3, expected: 6, .. }));
        assert_eq!(recorder.len(), 1);
        assert_eq!(recorder.transcript().entries()[0].payload, vec![0x45; 3]);

        device.fail_next_writes(1, WriteFault::Timeout);
        assert!(transport.write(&[0x79, 0x02], t).await.is_err());
        assert_eq!(recorder.len(), 1);

        transport.write(&[0x45; 3], t).await.unwrap();
        let payloads: Vec<Vec<u8>> = recorder.transcript().entries().iter().map(|e| e.payload.clone()).collect();
        assert_eq!(payloads, vec![vec![0x45; 3], vec![0x45; 3]]);
        assert_eq!(device.hello_count(), 1);
    }
}
