//! Frame types for the encode → transmit pipeline

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{LinkError, Result};

/// Bytes per RGB565 pixel on the wire.
pub const BYTES_PER_PIXEL: usize = 2;

/// A rectangular pixel region in panel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub const fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle covering a whole panel of the given extent.
    pub const fn full(width: u16, height: u16) -> Self {
        Self { x: 0, y: 0, width, height }
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Wire size of the pixel payload for this window.
    pub fn byte_len(&self) -> usize {
        self.area() * BYTES_PER_PIXEL
    }

    pub fn right(&self) -> u32 {
        self.x as u32 + self.width as u32
    }

    pub fn bottom(&self) -> u32 {
        self.y as u32 + self.height as u32
    }

    pub fn contains(&self, x: u16, y: u16) -> bool {
        x >= self.x && (x as u32) < self.right() && y >= self.y && (y as u32) < self.bottom()
    }

    /// Whether this rectangle lies entirely inside a `width` × `height` panel.
    pub fn fits_within(&self, width: u16, height: u16) -> bool {
        self.width > 0 && self.height > 0 && self.right() <= width as u32 && self.bottom() <= height as u32
    }
}

/// Whether a frame covers the whole panel or only a changed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum FrameKind {
    Full,
    Dirty,
}

/// An encoded pixel region ready for transmission.
///
/// The buffer is RGB565 little-endian, row-major, with no padding between
/// rows, so its length is always `width * height * 2`. The buffer is shared
/// (`Arc<[u8]>`) and never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    rect: Rect,
    kind: FrameKind,
    data: Arc<[u8]>,
}

impl Frame {
    /// Create a frame, checking the buffer length against the rectangle.
    pub fn new(rect: Rect, kind: FrameKind, data: Vec<u8>) -> Result<Self> {
        if rect.width == 0 || rect.height == 0 {
            return Err(LinkError::invalid_frame(format!(
                "empty region {}x{}",
                rect.width, rect.height
            )));
        }
        if data.len() != rect.byte_len() {
            return Err(LinkError::invalid_frame(format!(
                "buffer is {} bytes, {}x{} needs {}",
                data.len(),
                rect.width,
                rect.height,
                rect.byte_len()
            )));
        }
        Ok(Self { rect, kind, data: data.into() })
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn is_full(&self) -> bool {
        self.kind == FrameKind::Full
    }

    /// Raw RGB565 LE bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the pixel bytes
    pub fn shared_data(&self) -> Arc<[u8]> {
        Arc::clone(&self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_mismatched_buffer() {
        let rect = Rect::new(0, 0, 4, 2);
        assert!(Frame::new(rect, FrameKind::Full, vec![0; 16]).is_ok());
        assert!(Frame::new(rect, FrameKind::Full, vec![0; 15]).is_err());
        assert!(Frame::new(Rect::new(0, 0, 0, 2), FrameKind::Dirty, vec![]).is_err());
    }

    #[test]
    fn rect_bounds() {
        let rect = Rect::new(10, 20, 100, 50);
        assert!(rect.contains(10, 20));
        assert!(rect.contains(109, 69));
        assert!(!rect.contains(110, 20));
        assert!(rect.fits_within(800, 480));
        assert!(!Rect::new(790, 0, 11, 1).fits_within(800, 480));
        assert_eq!(rect.byte_len(), 100 * 50 * 2);
    }
}
