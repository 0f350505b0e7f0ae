//! USB serial transport backed by the `serialport` crate.
//!
//! `serialport` is blocking, so every read and write runs on the blocking
//! pool. The port handle moves into the blocking call and back out again,
//! which keeps [`Transport`] operations exclusive without holding a lock
//! across an await point.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, SerialPort, SerialPortType, StopBits};
use tracing::{debug, info, warn};

use super::Transport;
use crate::types::{DeviceDescriptor, DeviceSelector, LinkParams, PRODUCT_ID, Parity, VENDOR_ID};
use crate::{LinkError, Result};

/// Extra time granted to a blocking call beyond its own serial timeout.
const BLOCKING_GRACE: Duration = Duration::from_millis(250);

/// Serial timeout applied at open time, replaced per operation.
const OPEN_TIMEOUT: Duration = Duration::from_millis(100);

/// Ports held by a transport anywhere in this process.
static HELD_PORTS: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Process-wide claim on one port name, released on drop.
#[derive(Debug)]
pub(crate) struct PortLease {
    port: String,
}

impl PortLease {
    pub(crate) fn acquire(port: &str) -> Result<Self> {
        let mut held = HELD_PORTS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(port.to_string()) {
            return Err(LinkError::PortBusy { port: port.to_string() });
        }
        Ok(Self { port: port.to_string() })
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut held = HELD_PORTS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.port);
    }
}

struct OpenPort {
    port: Box<dyn SerialPort>,
    name: String,
    _lease: PortLease,
}

/// Enumerate every attached display with the revision A USB IDs.
///
/// On macOS only the `/dev/cu.*` call-out devices are returned; opening the
/// matching `/dev/tty.*` node blocks waiting for carrier detect.
pub fn discover() -> Result<Vec<DeviceDescriptor>> {
    enumerate(VENDOR_ID, PRODUCT_ID, &LinkParams::default())
}

fn enumerate(vendor_id: u16, product_id: u16, link: &LinkParams) -> Result<Vec<DeviceDescriptor>> {
    let ports = serialport::available_ports()
        .map_err(|e| LinkError::link_lost_with_source("failed to enumerate serial ports", Box::new(e)))?;

    Ok(ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .filter_map(|p| match p.port_type {
            SerialPortType::UsbPort(info) if info.vid == vendor_id && info.pid == product_id => {
                Some(DeviceDescriptor { vendor_id: info.vid, product_id: info.pid, port: p.port_name, link: link.clone() })
            }
            _ => None,
        })
        .collect())
}

/// USB IDs reported for an explicitly named port, when it enumerates as USB.
fn usb_ids(port_name: &str) -> Option<(u16, u16)> {
    serialport::available_ports().ok()?.into_iter().find_map(|p| match p.port_type {
        SerialPortType::UsbPort(info) if p.port_name == port_name => Some((info.vid, info.pid)),
        _ => None,
    })
}

fn to_serialport_parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn to_serialport_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

/// Write all bytes before `timeout` elapses. Returns the count written and
/// the error that stopped it, if any.
fn write_blocking(port: &mut dyn SerialPort, bytes: &[u8], timeout: Duration) -> (usize, Option<io::Error>) {
    let deadline = Instant::now() + timeout;
    if let Err(e) = port.set_timeout(timeout) {
        return (0, Some(io::Error::other(e)));
    }

    let mut written = 0;
    while written < bytes.len() {
        if Instant::now() >= deadline {
            return (written, Some(io::Error::from(io::ErrorKind::TimedOut)));
        }
        match port.write(&bytes[written..]) {
            Ok(0) => return (written, Some(io::Error::from(io::ErrorKind::WriteZero))),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (written, Some(e)),
        }
    }

    match port.flush() {
        Ok(()) => (written, None),
        Err(e) => (written, Some(e)),
    }
}

fn read_blocking(port: &mut dyn SerialPort, max: usize, timeout: Duration) -> io::Result<Vec<u8>> {
    port.set_timeout(timeout).map_err(io::Error::other)?;
    let mut buf = vec![0u8; max];
    loop {
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(Vec::new()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Transport over a real serial port.
#[derive(Default)]
pub struct SerialTransport {
    open: Option<OpenPort>,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the currently open port.
    pub fn port_name(&self) -> Option<&str> {
        self.open.as_ref().map(|open| open.name.as_str())
    }

    /// Run `op` against the open port on the blocking pool.
    ///
    /// `Ok(None)` means the call outlived `limit`; the port is abandoned to
    /// the blocking thread and this transport is closed.
    async fn with_port<R, F>(&mut self, limit: Duration, op: F) -> Result<Option<R>>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn SerialPort) -> R + Send + 'static,
    {
        let Some(mut open) = self.open.take() else {
            return Err(LinkError::link_lost("port is not open"));
        };

        let task = tokio::task::spawn_blocking(move || {
            let result = op(open.port.as_mut());
            (open, result)
        });

        match tokio::time::timeout(limit + BLOCKING_GRACE, task).await {
            Ok(Ok((open, result))) => {
                self.open = Some(open);
                Ok(Some(result))
            }
            Ok(Err(join)) => Err(LinkError::link_lost(format!("serial worker failed: {join}"))),
            Err(_) => {
                warn!(limit_ms = limit.as_millis() as u64, "Serial call stalled, abandoning port");
                Ok(None)
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for SerialTransport {
    async fn resolve(&mut self, selector: &DeviceSelector, link: &LinkParams) -> Result<DeviceDescriptor> {
        let selector = selector.clone();
        let link = link.clone();
        let target = selector.to_string();

        let found = tokio::task::spawn_blocking(move || -> Result<Option<DeviceDescriptor>> {
            match selector {
                DeviceSelector::Usb { vendor_id, product_id } => {
                    Ok(enumerate(vendor_id, product_id, &link)?.into_iter().next())
                }
                DeviceSelector::Port(port) => {
                    let (vendor_id, product_id) = usb_ids(&port).unwrap_or((VENDOR_ID, PRODUCT_ID));
                    Ok(Some(DeviceDescriptor { vendor_id, product_id, port, link }))
                }
            }
        })
        .await
        .map_err(|e| LinkError::link_lost(format!("port enumeration failed: {e}")))??;

        match found {
            Some(descriptor) => {
                debug!(port = %descriptor.port, %target, "Resolved display");
                Ok(descriptor)
            }
            None => Err(LinkError::DeviceNotFound { target }),
        }
    }

    async fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<()> {
        self.open = None;
        let lease = PortLease::acquire(&descriptor.port)?;

        let link = &descriptor.link;
        let builder = serialport::new(&descriptor.port, link.baud_rate)
            .data_bits(to_serialport_data_bits(link.data_bits))
            .parity(to_serialport_parity(link.parity))
            .stop_bits(to_serialport_stop_bits(link.stop_bits))
            .flow_control(if link.rts_cts { FlowControl::Hardware } else { FlowControl::None })
            .timeout(OPEN_TIMEOUT);

        let name = descriptor.port.clone();
        let port = tokio::task::spawn_blocking(move || builder.open())
            .await
            .map_err(|e| LinkError::link_lost(format!("open worker failed: {e}")))?
            .map_err(|e| LinkError::from_open_error(&name, e))?;

        info!(port = %name, baud = link.baud_rate, rts_cts = link.rts_cts, "Serial port opened");
        self.open = Some(OpenPort { port, name, _lease: lease });
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize> {
        let expected = bytes.len();
        let payload = bytes.to_vec();

        match self.with_port(timeout, move |port| write_blocking(port, &payload, timeout)).await? {
            Some((written, None)) => Ok(written),
            Some((written, Some(e)))
                if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) =>
            {
                Err(LinkError::WriteTimeout { timeout, written, expected })
            }
            Some((_, Some(e))) => Err(LinkError::link_lost_with_source("serial write failed", Box::new(e))),
            None => Err(LinkError::WriteTimeout { timeout, written: 0, expected }),
        }
    }

    async fn read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        match self.with_port(timeout, move |port| read_blocking(port, max, timeout)).await? {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(e)) => Err(LinkError::link_lost_with_source("serial read failed", Box::new(e))),
            None => Err(LinkError::link_lost("serial read stalled")),
        }
    }

    async fn discard_input(&mut self) -> Result<()> {
        if self.open.is_none() {
            return Ok(());
        }
        match self.with_port(OPEN_TIMEOUT, |port| port.clear(ClearBuffer::Input)).await? {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(LinkError::link_lost_with_source("failed to clear input", Box::new(e))),
            None => Err(LinkError::link_lost("clearing input stalled")),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(open) = self.open.take() {
            info!(port = %open.name, "Serial port closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_exclusive_per_port() {
        let first = PortLease::acquire("/dev/ttyTEST-lease").unwrap();
        let second = PortLease::acquire("/dev/ttyTEST-lease");
        assert!(matches!(second, Err(LinkError::PortBusy { .. })));
        drop(first);
        assert!(PortLease::acquire("/dev/ttyTEST-lease").is_ok());
    }

    #[tokio::test]
    async fn closed_port_calls() {
        let mut transport = SerialTransport::new();
        assert!(!transport.is_open());
        transport.discard_input().await.unwrap();
        transport.close().await.unwrap();
        let err = transport.write(&[0x45; 6], Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, LinkError::LinkLost { .. }));
        assert!(transport.read(6, Duration::from_millis(10)).await.is_err());
    }

    #[test]
    fn line_parameter_conversion() {
        assert!(matches!(to_serialport_parity(Parity::Even), serialport::Parity::Even));
        assert!(matches!(to_serialport_data_bits(8), DataBits::Eight));
        assert!(matches!(to_serialport_data_bits(7), DataBits::Seven));
        assert!(matches!(to_serialport_stop_bits(2), StopBits::Two));
        assert!(matches!(to_serialport_stop_bits(0), StopBits::One));
    }

    #[tokio::test]
    async fn operations_on_a_closed_port_report_link_loss() {
        let mut transport = SerialTransport::new();
        assert!(!transport.is_open());
        let err = transport.write(&[0x45], Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, LinkError::LinkLost { .. }));
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }
}
