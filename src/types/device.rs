//! Device identification and serial line parameters

use serde::{Deserialize, Serialize};
use std::fmt;

/// USB vendor ID of the revision A display bridge.
pub const VENDOR_ID: u16 = 0x1A86;

/// USB product ID of the revision A display bridge.
pub const PRODUCT_ID: u16 = 0x5722;

/// Native streaming width in landscape orientation.
pub const PANEL_WIDTH: u16 = 800;

/// Native streaming height in landscape orientation.
pub const PANEL_HEIGHT: u16 = 480;

/// Line rate the display firmware expects.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Parity setting for the serial line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Fixed serial line parameters applied at open time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkParams {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    /// Hardware RTS/CTS flow control
    pub rts_cts: bool,
}

impl Default for LinkParams {
    fn default() -> Self {
        Self { baud_rate: DEFAULT_BAUD_RATE, data_bits: 8, parity: Parity::None, stop_bits: 1, rts_cts: true }
    }
}

impl LinkParams {
    /// Check the parameters describe a line the serial layer can open.
    pub fn validate(&self) -> crate::Result<()> {
        if self.baud_rate == 0 {
            return Err(crate::LinkError::invalid_config("link.baud_rate", "must be non-zero"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(crate::LinkError::invalid_config("link.data_bits", "must be 5 to 8"));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(crate::LinkError::invalid_config("link.stop_bits", "must be 1 or 2"));
        }
        Ok(())
    }
}

/// How to locate the display on each (re)connect attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSelector {
    /// First enumerated USB serial port matching the IDs
    Usb { vendor_id: u16, product_id: u16 },
    /// Explicit port path, skipping enumeration
    Port(String),
}

impl Default for DeviceSelector {
    fn default() -> Self {
        DeviceSelector::Usb { vendor_id: VENDOR_ID, product_id: PRODUCT_ID }
    }
}

impl DeviceSelector {
    pub fn validate(&self) -> crate::Result<()> {
        match self {
            DeviceSelector::Port(port) if port.trim().is_empty() => {
                Err(crate::LinkError::invalid_config("device.port", "must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Usb { vendor_id, product_id } => {
                write!(f, "{:04X}:{:04X}", vendor_id, product_id)
            }
            DeviceSelector::Port(port) => f.write_str(port),
        }
    }
}

/// A resolved display: which port to open and how.
///
/// Produced fresh by [`Transport::resolve`](crate::transport::Transport::resolve)
/// on every connect attempt, then held unchanged for the lifetime of the
/// opened session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub port: String,
    pub link: LinkParams,
}
