//! Byte transports for the display link.
//!
//! A [`Transport`] owns one serial link. Implementations:
//!
//! - [`SerialTransport`] - a real USB serial port via `serialport`
//! - [`SimulatedTransport`] - an in-memory display with fault injection
//! - [`RecordingTransport`] - wraps another transport and captures a transcript
//! - [`ScriptedTransport`](crate::replay::ScriptedTransport) - plays a transcript back
//!
//! Every operation takes `&mut self`, so a handle never has two operations
//! in flight.

mod recording;
mod serial;
mod sim;

pub use recording::{RecordingTransport, TranscriptRecorder};
pub use serial::{SerialTransport, discover};
pub use sim::{SimulatedDevice, SimulatedTransport, WriteFault};

use std::time::Duration;

use crate::Result;
use crate::types::{DeviceDescriptor, DeviceSelector, LinkParams};

/// An exclusive, byte-oriented link to one display.
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    /// Locate the display for a connect attempt.
    ///
    /// Called fresh on every attempt so a replugged device that enumerates
    /// under a new port name is found again.
    async fn resolve(&mut self, selector: &DeviceSelector, link: &LinkParams) -> Result<DeviceDescriptor>;

    /// Open the port described by `descriptor` and apply its line parameters.
    ///
    /// Sends nothing. Fails with `DeviceNotFound`, `PermissionDenied` or
    /// `PortBusy`.
    async fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<()>;

    /// Write all of `bytes` within `timeout`.
    ///
    /// A partial write is reported as `WriteTimeout` carrying the number of
    /// bytes that did go out.
    async fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize>;

    /// Read up to `max` bytes. An empty vector means the timeout elapsed.
    async fn read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Drop any unread input.
    async fn discard_input(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release the port. Idempotent.
    async fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;
}

#[async_trait::async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn resolve(&mut self, selector: &DeviceSelector, link: &LinkParams) -> Result<DeviceDescriptor> {
        (**self).resolve(selector, link).await
    }

    async fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<()> {
        (**self).open(descriptor).await
    }

    async fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize> {
        (**self).write(bytes, timeout).await
    }

    async fn read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        (**self).read(max, timeout).await
    }

    async fn discard_input(&mut self) -> Result<()> {
        (**self).discard_input().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}
