//! Device-side view of the host byte stream.
//!
//! Interprets host-to-device bytes the way the panel firmware does: fixed
//! length commands, and after a window command exactly `w * h * 2` bytes of
//! pixel data. Input may be split at any byte boundary.

use super::{CMD_SET_BRIGHTNESS, CMD_SET_ORIENTATION, CMD_SET_WINDOW, HELLO_BYTE, command_len};
use crate::types::Rect;

/// One decoded unit of the host stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Hello,
    /// Raw orientation code byte
    Orientation(u8),
    /// Raw backlight level byte
    Brightness(u8),
    Window(Rect),
    /// Pixel bytes for the current window, `offset` bytes into its payload
    Pixels { offset: usize, bytes: Vec<u8> },
    /// The current window received its last pixel byte
    FrameComplete(Rect),
    /// A byte outside any known command
    Unknown(u8),
}

#[derive(Debug, Default)]
enum Phase {
    #[default]
    Idle,
    Command { tag: u8, params: Vec<u8>, needed: usize },
    Pixels { rect: Rect, received: usize },
}

/// Incremental decoder for host-to-device bytes.
#[derive(Debug, Default)]
pub struct DeviceDecoder {
    phase: Phase,
    consumed: usize,
}

impl DeviceDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes fed so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Window whose pixel payload is still incomplete.
    pub fn pending_window(&self) -> Option<Rect> {
        match self.phase {
            Phase::Pixels { rect, .. } => Some(rect),
            _ => None,
        }
    }

    /// Feed a chunk and collect every event it completes.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        self.consumed += bytes.len();

        while !bytes.is_empty() {
            match &mut self.phase {
                Phase::Idle => {
                    let tag = bytes[0];
                    bytes = &bytes[1..];
                    match command_len(tag) {
                        Some(len) => {
                            self.phase = Phase::Command { tag, params: Vec::with_capacity(len - 1), needed: len - 1 }
                        }
                        None => events.push(DeviceEvent::Unknown(tag)),
                    }
                }
                Phase::Command { tag, params, needed } => {
                    let take = (*needed - params.len()).min(bytes.len());
                    params.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if params.len() == *needed {
                        let tag = *tag;
                        let params = std::mem::take(params);
                        self.phase = Phase::Idle;
                        self.finish_command(tag, &params, &mut events);
                    }
                }
                Phase::Pixels { rect, received } => {
                    let total = rect.byte_len();
                    let take = (total - *received).min(bytes.len());
                    events.push(DeviceEvent::Pixels { offset: *received, bytes: bytes[..take].to_vec() });
                    *received += take;
                    bytes = &bytes[take..];
                    if *received == total {
                        events.push(DeviceEvent::FrameComplete(*rect));
                        self.phase = Phase::Idle;
                    }
                }
            }
        }

        events
    }

    fn finish_command(&mut self, tag: u8, params: &[u8], events: &mut Vec<DeviceEvent>) {
        match tag {
            HELLO_BYTE => events.push(DeviceEvent::Hello),
            CMD_SET_ORIENTATION => events.push(DeviceEvent::Orientation(params[0])),
            CMD_SET_BRIGHTNESS => events.push(DeviceEvent::Brightness(params[0])),
            CMD_SET_WINDOW => {
                let word = |i: usize| u16::from_le_bytes([params[i], params[i + 1]]);
                let rect = Rect::new(word(0), word(2), word(4), word(6));
                events.push(DeviceEvent::Window(rect));
                if rect.area() > 0 {
                    self.phase = Phase::Pixels { rect, received: 0 };
                }
            }
            other => events.push(DeviceEvent::Unknown(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Orientation, ProtocolCommand};

    fn stream() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&ProtocolCommand::Hello.encode());
        bytes.extend_from_slice(&ProtocolCommand::SetOrientation(Orientation::Landscape).encode());
        bytes.extend_from_slice(&ProtocolCommand::SetWindow(Rect::new(1, 1, 2, 2)).encode());
        bytes.extend_from_slice(&[0xAA; 8]);
        bytes.extend_from_slice(&ProtocolCommand::SetBrightness(100).encode());
        bytes
    }

    #[test]
    fn decodes_a_whole_session() {
        let events = DeviceDecoder::new().feed(&stream());
        assert_eq!(
            events,
            vec![
                DeviceEvent::Hello,
                DeviceEvent::Orientation(2),
                DeviceEvent::Window(Rect::new(1, 1, 2, 2)),
                DeviceEvent::Pixels { offset: 0, bytes: vec![0xAA; 8] },
                DeviceEvent::FrameComplete(Rect::new(1, 1, 2, 2)),
                DeviceEvent::Brightness(0),
            ]
        );
    }

    #[test]
    fn byte_at_a_time_yields_the_same_commands() {
        let mut decoder = DeviceDecoder::new();
        let mut events = Vec::new();
        for byte in stream() {
            events.extend(decoder.feed(&[byte]));
        }
        let pixel_bytes: usize = events
            .iter()
            .map(|e| match e {
                DeviceEvent::Pixels { bytes, .. } => bytes.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(pixel_bytes, 8);
        assert!(events.contains(&DeviceEvent::FrameComplete(Rect::new(1, 1, 2, 2))));
        assert_eq!(events.last(), Some(&DeviceEvent::Brightness(0)));
        assert_eq!(decoder.consumed(), stream().len());
    }

    #[test]
    fn command_bytes_inside_a_window_are_pixels() {
        let mut decoder = DeviceDecoder::new();
        decoder.feed(&ProtocolCommand::SetWindow(Rect::new(0, 0, 1, 1)).encode());
        assert_eq!(decoder.pending_window(), Some(Rect::new(0, 0, 1, 1)));
        let events = decoder.feed(&[0x45, 0x45]);
        assert_eq!(events[0], DeviceEvent::Pixels { offset: 0, bytes: vec![0x45, 0x45] });
        assert_eq!(decoder.pending_window(), None);
    }

    #[test]
    fn unknown_bytes_are_reported() {
        let events = DeviceDecoder::new().feed(&[0x00, 0xFF]);
        assert_eq!(events, vec![DeviceEvent::Unknown(0x00), DeviceEvent::Unknown(0xFF)]);
    }
}
