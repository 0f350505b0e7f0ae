//! In-memory display for development without hardware.
//!
//! [`SimulatedDevice`] is the test-side control handle: it configures the
//! HELLO reply, injects open and write faults, unplugs and replugs the
//! device, and exposes what the panel would currently show.
//! [`SimulatedTransport`] is the [`Transport`] a session talks to.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::trace;

use super::Transport;
use crate::codec::{Bitmap, Rgb565, decode_pixels};
use crate::protocol::{DeviceDecoder, DeviceEvent, HELLO_LEN};
use crate::types::{DeviceDescriptor, DeviceSelector, LinkParams, PRODUCT_ID, Rect, VENDOR_ID};
use crate::{LinkError, Result};

/// Failure injected into a simulated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFault {
    /// Nothing is accepted until the write timeout expires
    Timeout,
    /// The link drops mid-write
    LinkLost,
    /// The first `n` bytes reach the panel, then the write times out
    Partial(usize),
}

struct SimState {
    port: String,
    plugged: bool,
    held: bool,
    hello_reply: Option<Vec<u8>>,
    failing_opens: u32,
    write_faults: VecDeque<Option<WriteFault>>,
    write_latency: Duration,
    outbound: VecDeque<u8>,
    decoder: DeviceDecoder,
    window_bytes: Vec<u8>,
    framebuffer: Bitmap,
    windows: Vec<Rect>,
    orientation: Option<u8>,
    brightness: Option<u8>,
    opens: u32,
    hellos: u32,
    bytes_received: u64,
}

impl SimState {
    fn apply(&mut self, events: Vec<DeviceEvent>) {
        for event in events {
            match event {
                DeviceEvent::Hello => {
                    self.hellos += 1;
                    if let Some(reply) = &self.hello_reply {
                        self.outbound.extend(reply.iter().copied());
                    }
                }
                DeviceEvent::Orientation(code) => self.orientation = Some(code),
                DeviceEvent::Brightness(level) => self.brightness = Some(level),
                DeviceEvent::Window(rect) => {
                    self.windows.push(rect);
                    self.window_bytes.clear();
                }
                DeviceEvent::Pixels { bytes, .. } => self.window_bytes.extend_from_slice(&bytes),
                DeviceEvent::FrameComplete(rect) => {
                    let pixels = decode_pixels(&self.window_bytes);
                    if self.framebuffer.blit(rect, &pixels).is_err() {
                        trace!(?rect, "Window outside simulated panel, pixels dropped");
                    }
                    self.window_bytes.clear();
                }
                DeviceEvent::Unknown(byte) => trace!(byte, "Simulated panel ignored byte"),
            }
        }
    }
}

/// Control handle for a simulated display.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    /// A plugged-in 5" panel of the given size that answers HELLO with `02×6`.
    pub fn new(width: u16, height: u16) -> Self {
        let state = SimState {
            port: "sim://display0".to_string(),
            plugged: true,
            held: false,
            hello_reply: Some(vec![0x02; HELLO_LEN]),
            failing_opens: 0,
            write_faults: VecDeque::new(),
            write_latency: Duration::ZERO,
            outbound: VecDeque::new(),
            decoder: DeviceDecoder::new(),
            window_bytes: Vec::new(),
            framebuffer: Bitmap::filled(width, height, Rgb565::BLACK),
            windows: Vec::new(),
            orientation: None,
            brightness: None,
            opens: 0,
            hellos: 0,
            bytes_received: 0,
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A transport connected to this device.
    pub fn transport(&self) -> SimulatedTransport {
        SimulatedTransport { device: self.clone(), open: false }
    }

    pub fn port_name(&self) -> String {
        self.lock().port.clone()
    }

    /// Bytes sent in answer to HELLO; `None` makes the device silent.
    pub fn set_hello_reply(&self, reply: Option<Vec<u8>>) {
        self.lock().hello_reply = reply;
    }

    /// Fail the next `count` writes with `fault`.
    pub fn fail_next_writes(&self, count: usize, fault: WriteFault) {
        self.fail_writes_after(0, count, fault);
    }

    /// Let `skip` writes through, then fail `count` with `fault`.
    pub fn fail_writes_after(&self, skip: usize, count: usize, fault: WriteFault) {
        let mut state = self.lock();
        state.write_faults.clear();
        state.write_faults.extend(std::iter::repeat_n(None, skip));
        state.write_faults.extend(std::iter::repeat_n(Some(fault), count));
    }

    /// Fail the next `count` opens as if the device had not enumerated.
    pub fn fail_next_opens(&self, count: u32) {
        self.lock().failing_opens = count;
    }

    /// Time each write takes to drain.
    pub fn set_write_latency(&self, latency: Duration) {
        self.lock().write_latency = latency;
    }

    /// Pull the cable. Open transports see `LinkLost` until reopened.
    pub fn unplug(&self) {
        self.lock().plugged = false;
    }

    pub fn replug(&self) {
        let mut state = self.lock();
        state.plugged = true;
        state.decoder = DeviceDecoder::new();
        state.window_bytes.clear();
    }

    /// What the panel currently shows.
    pub fn snapshot(&self) -> Bitmap {
        self.lock().framebuffer.clone()
    }

    /// Every window command received, in order.
    pub fn windows(&self) -> Vec<Rect> {
        self.lock().windows.clone()
    }

    pub fn open_count(&self) -> u32 {
        self.lock().opens
    }

    pub fn hello_count(&self) -> u32 {
        self.lock().hellos
    }

    /// Last orientation code received.
    pub fn orientation(&self) -> Option<u8> {
        self.lock().orientation
    }

    /// Last raw backlight level received.
    pub fn brightness_level(&self) -> Option<u8> {
        self.lock().brightness
    }

    pub fn bytes_received(&self) -> u64 {
        self.lock().bytes_received
    }

    /// Whether a transport currently holds the device open.
    pub fn is_held(&self) -> bool {
        self.lock().held
    }
}

/// [`Transport`] over a [`SimulatedDevice`].
pub struct SimulatedTransport {
    device: SimulatedDevice,
    open: bool,
}

impl SimulatedTransport {
    pub fn device(&self) -> &SimulatedDevice {
        &self.device
    }

    fn check_link(&self, state: &SimState) -> Result<()> {
        if !self.open {
            return Err(LinkError::link_lost("port is not open"));
        }
        if !state.plugged {
            return Err(LinkError::link_lost("device unplugged"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for SimulatedTransport {
    async fn resolve(&mut self, selector: &DeviceSelector, link: &LinkParams) -> Result<DeviceDescriptor> {
        let state = self.device.lock();
        let matches = match selector {
            DeviceSelector::Usb { vendor_id, product_id } => *vendor_id == VENDOR_ID && *product_id == PRODUCT_ID,
            DeviceSelector::Port(port) => *port == state.port,
        };
        if !state.plugged || !matches {
            return Err(LinkError::DeviceNotFound { target: selector.to_string() });
        }
        Ok(DeviceDescriptor { vendor_id: VENDOR_ID, product_id: PRODUCT_ID, port: state.port.clone(), link: link.clone() })
    }

    async fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<()> {
        let mut state = self.device.lock();
        if self.open {
            state.held = false;
            self.open = false;
        }
        if !state.plugged || descriptor.port != state.port {
            return Err(LinkError::DeviceNotFound { target: descriptor.port.clone() });
        }
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(LinkError::DeviceNotFound { target: descriptor.port.clone() });
        }
        if state.held {
            return Err(LinkError::PortBusy { port: descriptor.port.clone() });
        }

        state.held = true;
        state.opens += 1;
        state.decoder = DeviceDecoder::new();
        state.window_bytes.clear();
        state.outbound.clear();
        self.open = true;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize> {
        let (fault, latency) = {
            let mut state = self.device.lock();
            self.check_link(&state)?;
            (state.write_faults.pop_front().flatten(), state.write_latency)
        };

        match fault {
            Some(WriteFault::Timeout) => {
                tokio::time::sleep(timeout).await;
                return Err(LinkError::WriteTimeout { timeout, written: 0, expected: bytes.len() });
            }
            Some(WriteFault::LinkLost) => return Err(LinkError::link_lost("simulated link drop")),
            Some(WriteFault::Partial(accepted)) => {
                let written = accepted.min(bytes.len());
                {
                    let mut state = self.device.lock();
                    state.bytes_received += written as u64;
                    let events = state.decoder.feed(&bytes[..written]);
                    state.apply(events);
                }
                tokio::time::sleep(timeout).await;
                return Err(LinkError::WriteTimeout { timeout, written, expected: bytes.len() });
            }
            None => {}
        }

        if !latency.is_zero() {
            if latency > timeout {
                tokio::time::sleep(timeout).await;
                return Err(LinkError::WriteTimeout { timeout, written: 0, expected: bytes.len() });
            }
            tokio::time::sleep(latency).await;
        }

        let mut state = self.device.lock();
        self.check_link(&state)?;
        state.bytes_received += bytes.len() as u64;
        let events = state.decoder.feed(bytes);
        state.apply(events);
        Ok(bytes.len())
    }

    async fn read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        {
            let mut state = self.device.lock();
            self.check_link(&state)?;
            if !state.outbound.is_empty() {
                let take = max.min(state.outbound.len());
                return Ok(state.outbound.drain(..take).collect());
            }
        }
        if !timeout.is_zero() {
            tokio::time::sleep(timeout).await;
        }
        Ok(Vec::new())
    }

    async fn discard_input(&mut self) -> Result<()> {
        self.device.lock().outbound.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.device.lock().held = false;
            self.open = false;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        if self.open {
            self.device.lock().held = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_full;
    use crate::protocol::ProtocolCommand;

    const T: Duration = Duration::from_millis(50);

    async fn opened(device: &SimulatedDevice) -> SimulatedTransport {
        let mut transport = device.transport();
        let descriptor = transport.resolve(&DeviceSelector::default(), &LinkParams::default()).await.unwrap();
        transport.open(&descriptor).await.unwrap();
        transport
    }

    #[tokio::test(start_paused = true)]
    async fn answers_hello_with_configured_reply() {
        let device = SimulatedDevice::new(8, 4);
        let mut transport = opened(&device).await;

        transport.write(&ProtocolCommand::Hello.encode(), T).await.unwrap();
        assert_eq!(transport.read(64, T).await.unwrap(), vec![0x02; 6]);
        assert!(transport.read(64, T).await.unwrap().is_empty());

        device.set_hello_reply(None);
        transport.write(&ProtocolCommand::Hello.encode(), T).await.unwrap();
        assert!(transport.read(64, T).await.unwrap().is_empty());
        assert_eq!(device.hello_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rebuilds_the_framebuffer_from_chunked_pixels() {
        let device = SimulatedDevice::new(8, 4);
        let mut transport = opened(&device).await;

        let mut bitmap = Bitmap::filled(8, 4, Rgb565::BLACK);
        bitmap.fill_rect(Rect::new(2, 1, 3, 2), Rgb565(0xBEEF));
        let frame = encode_full(&bitmap);

        transport.write(&ProtocolCommand::SetWindow(frame.rect()).encode(), T).await.unwrap();
        for chunk in frame.data().chunks(5) {
            transport.write(chunk, T).await.unwrap();
        }

        assert_eq!(device.snapshot(), bitmap);
        assert_eq!(device.windows(), vec![Rect::new(0, 0, 8, 4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_open_is_busy() {
        let device = SimulatedDevice::new(8, 4);
        let _first = opened(&device).await;

        let mut second = device.transport();
        let descriptor = second.resolve(&DeviceSelector::default(), &LinkParams::default()).await.unwrap();
        let err = second.open(&descriptor).await.unwrap_err();
        assert!(matches!(err, LinkError::PortBusy { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn injected_faults_and_unplug() {
        let device = SimulatedDevice::new(8, 4);
        let mut transport = opened(&device).await;

        device.fail_next_writes(1, WriteFault::Timeout);
        let err = transport.write(&[0x00], T).await.unwrap_err();
        assert!(matches!(err, LinkError::WriteTimeout { written: 0, expected: 1, .. }));

        device.unplug();
        assert!(matches!(transport.write(&[0x00], T).await, Err(LinkError::LinkLost { .. })));
        transport.close().await.unwrap();
        assert!(!device.is_held());
        assert!(transport.resolve(&DeviceSelector::default(), &LinkParams::default()).await.is_err());

        device.replug();
        let _transport = opened(&device).await;
        assert_eq!(device.open_count(), 2);
    }
}
