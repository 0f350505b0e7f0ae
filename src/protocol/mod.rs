//! Revision A wire protocol.
//!
//! Commands are a single tag byte followed by a fixed-size parameter block:
//!
//! | Command | Bytes |
//! |---|---|
//! | Hello | `45 45 45 45 45 45` |
//! | Set orientation | `79 <code>` |
//! | Set brightness | `6E <level>` |
//! | Set window | `C5 xL xH yL yH wL wH hL hH` |
//! | Pixel stream | raw RGB565 LE, length implied by the window |
//!
//! There is no checksum and no framing around pixel data: after a window
//! command the display consumes exactly `w * h * 2` bytes as pixels.

mod decoder;

pub use decoder::{DeviceDecoder, DeviceEvent};

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;

use crate::types::Rect;
use crate::{LinkError, Result};

pub const HELLO_BYTE: u8 = 0x45;
pub const HELLO_LEN: usize = 6;
pub const CMD_SET_ORIENTATION: u8 = 0x79;
pub const CMD_SET_BRIGHTNESS: u8 = 0x6E;
pub const CMD_SET_WINDOW: u8 = 0xC5;

/// The HELLO probe.
pub const HELLO: [u8; HELLO_LEN] = [HELLO_BYTE; HELLO_LEN];

/// Total encoded length of a command given its tag byte.
pub fn command_len(tag: u8) -> Option<usize> {
    match tag {
        HELLO_BYTE => Some(HELLO_LEN),
        CMD_SET_ORIENTATION | CMD_SET_BRIGHTNESS => Some(2),
        CMD_SET_WINDOW => Some(9),
        _ => None,
    }
}

/// Panel orientation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Portrait,
    ReversePortrait,
    #[default]
    Landscape,
    ReverseLandscape,
}

impl Orientation {
    /// Orientation for a rotation angle in degrees.
    pub fn from_angle(angle: u16) -> Result<Self> {
        match angle % 360 {
            0 => Ok(Orientation::Portrait),
            90 => Ok(Orientation::Landscape),
            180 => Ok(Orientation::ReversePortrait),
            270 => Ok(Orientation::ReverseLandscape),
            other => Err(LinkError::invalid_config(
                "orientation",
                format!("{other} is not a multiple of 90 degrees"),
            )),
        }
    }

    /// Code byte sent after [`CMD_SET_ORIENTATION`].
    pub fn code(self) -> u8 {
        match self {
            Orientation::Portrait => 0,
            Orientation::ReversePortrait => 1,
            Orientation::Landscape => 2,
            Orientation::ReverseLandscape => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Orientation::Portrait),
            1 => Some(Orientation::ReversePortrait),
            2 => Some(Orientation::Landscape),
            3 => Some(Orientation::ReverseLandscape),
            _ => None,
        }
    }
}

/// Every byte sequence the host may send. Built by the session only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolCommand {
    Hello,
    SetOrientation(Orientation),
    /// Brightness in percent, 0–100
    SetBrightness(u8),
    SetWindow(Rect),
    PixelStream(Arc<[u8]>),
}

impl ProtocolCommand {
    /// Wire bytes for this command.
    pub fn encode(&self) -> Cow<'_, [u8]> {
        match self {
            ProtocolCommand::Hello => Cow::Borrowed(&HELLO),
            ProtocolCommand::SetOrientation(orientation) => {
                Cow::Owned(vec![CMD_SET_ORIENTATION, orientation.code()])
            }
            ProtocolCommand::SetBrightness(percent) => {
                Cow::Owned(vec![CMD_SET_BRIGHTNESS, brightness_level(*percent)])
            }
            ProtocolCommand::SetWindow(rect) => {
                let mut bytes = Vec::with_capacity(9);
                bytes.push(CMD_SET_WINDOW);
                for value in [rect.x, rect.y, rect.width, rect.height] {
                    bytes.extend_from_slice(&value.to_le_bytes());
                }
                Cow::Owned(bytes)
            }
            ProtocolCommand::PixelStream(bytes) => Cow::Borrowed(bytes),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolCommand::Hello => "hello",
            ProtocolCommand::SetOrientation(_) => "set_orientation",
            ProtocolCommand::SetBrightness(_) => "set_brightness",
            ProtocolCommand::SetWindow(_) => "set_window",
            ProtocolCommand::PixelStream(_) => "pixel_stream",
        }
    }
}

/// Absolute backlight level: the panel treats 0 as brightest.
pub fn brightness_level(percent: u8) -> u8 {
    let percent = percent.min(100) as u32;
    (255 - (percent * 255) / 100) as u8
}

/// Inverse of [`brightness_level`], rounded to the nearest percent.
pub fn brightness_percent(level: u8) -> u8 {
    (((255 - level as u32) * 100 + 127) / 255) as u8
}

/// Hardware variant identified from the HELLO reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubRevision {
    /// Device echoed the probe without naming a variant
    Echo,
    UsbMonitor35,
    UsbMonitor5,
    UsbMonitor7,
    /// Legacy unit that accepts commands but never answers HELLO
    Silent,
}

impl SubRevision {
    /// Portrait-native resolution, when the variant is known.
    pub fn portrait_resolution(self) -> Option<(u16, u16)> {
        match self {
            SubRevision::UsbMonitor35 => Some((320, 480)),
            SubRevision::UsbMonitor5 => Some((480, 800)),
            SubRevision::UsbMonitor7 => Some((600, 1024)),
            SubRevision::Echo | SubRevision::Silent => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SubRevision::Echo => "echo",
            SubRevision::UsbMonitor35 => "usbmonitor_3_5",
            SubRevision::UsbMonitor5 => "usbmonitor_5",
            SubRevision::UsbMonitor7 => "usbmonitor_7",
            SubRevision::Silent => "silent",
        }
    }
}

/// Classify a complete six-byte HELLO reply. `None` means rejected.
pub fn classify_hello_reply(reply: &[u8]) -> Option<SubRevision> {
    if reply.len() != HELLO_LEN {
        return None;
    }
    let first = reply[0];
    if reply.iter().any(|b| *b != first) {
        return None;
    }
    match first {
        HELLO_BYTE => Some(SubRevision::Echo),
        0x01 => Some(SubRevision::UsbMonitor35),
        0x02 => Some(SubRevision::UsbMonitor5),
        0x03 => Some(SubRevision::UsbMonitor7),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_is_six_0x45() {
        assert_eq!(ProtocolCommand::Hello.encode().as_ref(), &[0x45; 6]);
    }

    #[test]
    fn window_parameters_are_u16_little_endian() {
        let bytes = ProtocolCommand::SetWindow(Rect::new(0, 0, 800, 480)).encode().into_owned();
        assert_eq!(bytes, vec![0xC5, 0x00, 0x00, 0x00, 0x00, 0x20, 0x03, 0xE0, 0x01]);

        let command = ProtocolCommand::SetWindow(Rect::new(0x0102, 0x0304, 100, 50));
        let bytes = command.encode();
        assert_eq!(bytes.as_ref(), &[0xC5, 0x02, 0x01, 0x04, 0x03, 100, 0, 50, 0]);
    }

    #[test]
    fn orientation_command_is_two_bytes() {
        let bytes = ProtocolCommand::SetOrientation(Orientation::Landscape).encode();
        assert_eq!(bytes.as_ref(), &[0x79, 0x02]);
        assert_eq!(Orientation::from_angle(270).unwrap(), Orientation::ReverseLandscape);
        assert!(Orientation::from_angle(45).is_err());
    }

    #[test]
    fn brightness_is_inverted() {
        assert_eq!(brightness_level(100), 0);
        assert_eq!(brightness_level(0), 255);
        assert_eq!(brightness_level(200), 0);
        for percent in [0u8, 10, 33, 50, 80, 100] {
            assert_eq!(brightness_percent(brightness_level(percent)), percent);
        }
    }

    #[test]
    fn hello_replies_identify_sub_revisions() {
        assert_eq!(classify_hello_reply(&[0x45; 6]), Some(SubRevision::Echo));
        assert_eq!(classify_hello_reply(&[0x02; 6]), Some(SubRevision::UsbMonitor5));
        assert_eq!(SubRevision::UsbMonitor5.portrait_resolution(), Some((480, 800)));
        assert_eq!(classify_hello_reply(&[0x02, 0x02, 0x02]), None);
        assert_eq!(classify_hello_reply(&[0x02, 0x02, 0x02, 0x02, 0x02, 0x09]), None);
        assert_eq!(classify_hello_reply(&[0xFF; 6]), None);
    }

    #[test]
    fn pixel_stream_is_sent_as_is() {
        let pixels: Arc<[u8]> = Arc::from(vec![0x1F, 0x00, 0xE0, 0x07]);
        let command = ProtocolCommand::PixelStream(Arc::clone(&pixels));
        assert!(matches!(command.encode(), Cow::Borrowed(bytes) if bytes == &pixels[..]));
        assert_eq!(command.name(), "pixel_stream");
    }

    #[test]
    fn command_lengths_match_encoding() {
        let commands = [
            ProtocolCommand::Hello,
            ProtocolCommand::SetOrientation(Orientation::Portrait),
            ProtocolCommand::SetBrightness(40),
            ProtocolCommand::SetWindow(Rect::new(1, 2, 3, 4)),
        ];
        for command in commands {
            let bytes = command.encode();
            assert_eq!(command_len(bytes[0]), Some(bytes.len()), "{}", command.name());
        }
    }
}
