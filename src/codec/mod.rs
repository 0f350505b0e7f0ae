//! RGB565 frame codec.
//!
//! Converts composed bitmaps into the display's wire format: 16 bits per
//! pixel with a 5-6-5 red/green/blue split, little-endian byte order,
//! row-major, no padding between rows.
//!
//! ```rust
//! use smartscreen::codec::{Bitmap, Rgb565, decode_frame, encode_full};
//!
//! let mut bitmap = Bitmap::filled(4, 2, Rgb565::BLACK);
//! bitmap.set_pixel(1, 1, Rgb565::from_rgb888(255, 0, 0));
//!
//! let frame = encode_full(&bitmap);
//! assert_eq!(frame.len(), 4 * 2 * 2);
//! assert_eq!(decode_frame(&frame), bitmap.pixels());
//! ```

mod diff;

pub use diff::{dirty_bounds, encode_dirty};

use std::fmt;

use crate::types::{BYTES_PER_PIXEL, Frame, FrameKind, Rect};
use crate::{LinkError, Result};

/// One packed 5-6-5 pixel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Rgb565(pub u16);

impl Rgb565 {
    pub const BLACK: Rgb565 = Rgb565(0x0000);
    pub const WHITE: Rgb565 = Rgb565(0xFFFF);

    /// Pack an 8-bit-per-channel colour, truncating the low bits.
    pub const fn from_rgb888(r: u8, g: u8, b: u8) -> Self {
        Rgb565((((r as u16) >> 3) << 11) | (((g as u16) >> 2) << 5) | ((b as u16) >> 3))
    }

    pub const fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    pub const fn from_le_bytes(bytes: [u8; 2]) -> Self {
        Rgb565(u16::from_le_bytes(bytes))
    }
}

/// A composed image at panel resolution, as supplied by the renderer.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u16,
    height: u16,
    pixels: Vec<Rgb565>,
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap").field("width", &self.width).field("height", &self.height).finish()
    }
}

impl Bitmap {
    /// Wrap a pixel vector, checking it matches the dimensions.
    pub fn new(width: u16, height: u16, pixels: Vec<Rgb565>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(LinkError::invalid_frame(format!(
                "{} pixels supplied for a {}x{} bitmap",
                pixels.len(),
                width,
                height
            )));
        }
        Ok(Self { width, height, pixels })
    }

    /// A bitmap painted a single colour. Zero dimensions are clamped to one.
    pub fn filled(width: u16, height: u16, color: Rgb565) -> Self {
        let (width, height) = (width.max(1), height.max(1));
        Self { width, height, pixels: vec![color; width as usize * height as usize] }
    }

    /// Convert tightly packed 24-bit RGB data.
    pub fn from_rgb888(width: u16, height: u16, rgb: &[u8]) -> Result<Self> {
        if rgb.len() % 3 != 0 {
            return Err(LinkError::invalid_frame("RGB888 length must be divisible by 3"));
        }
        let pixels =
            rgb.chunks_exact(3).map(|px| Rgb565::from_rgb888(px[0], px[1], px[2])).collect();
        Self::new(width, height, pixels)
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn bounds(&self) -> Rect {
        Rect::full(self.width, self.height)
    }

    pub fn pixels(&self) -> &[Rgb565] {
        &self.pixels
    }

    pub fn pixel(&self, x: u16, y: u16) -> Option<Rgb565> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get(self.index(x, y)).copied()
    }

    /// Set one pixel; out-of-range coordinates are ignored.
    pub fn set_pixel(&mut self, x: u16, y: u16, color: Rgb565) {
        if x < self.width && y < self.height {
            let index = self.index(x, y);
            self.pixels[index] = color;
        }
    }

    /// Paint a rectangle, clipped to the bitmap.
    pub fn fill_rect(&mut self, rect: Rect, color: Rgb565) {
        let right = rect.right().min(self.width as u32) as u16;
        let bottom = rect.bottom().min(self.height as u32) as u16;
        for y in rect.y..bottom {
            let start = self.index(rect.x.min(right), y);
            let end = self.index(0, y) + right as usize;
            self.pixels[start..end].fill(color);
        }
    }

    /// One row of pixels.
    pub fn row(&self, y: u16) -> &[Rgb565] {
        let start = y as usize * self.width as usize;
        &self.pixels[start..start + self.width as usize]
    }

    /// Copy a decoded region back into the bitmap (used by the simulated
    /// display to rebuild what the panel shows).
    pub fn blit(&mut self, rect: Rect, pixels: &[Rgb565]) -> Result<()> {
        if !rect.fits_within(self.width, self.height) || pixels.len() != rect.area() {
            return Err(LinkError::invalid_frame("region does not fit the bitmap"));
        }
        for (row, src) in pixels.chunks_exact(rect.width as usize).enumerate() {
            let start = self.index(rect.x, rect.y + row as u16);
            self.pixels[start..start + src.len()].copy_from_slice(src);
        }
        Ok(())
    }

    fn index(&self, x: u16, y: u16) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

/// Pack every pixel of the bitmap into a full frame.
pub fn encode_full(bitmap: &Bitmap) -> Frame {
    let mut data = Vec::with_capacity(bitmap.pixels.len() * BYTES_PER_PIXEL);
    for pixel in &bitmap.pixels {
        data.extend_from_slice(&pixel.to_le_bytes());
    }
    Frame::from_parts(bitmap.bounds(), FrameKind::Full, data)
}

/// Pack the pixels inside `rect` into a dirty-rect frame.
pub fn encode_region(bitmap: &Bitmap, rect: Rect) -> Result<Frame> {
    if !rect.fits_within(bitmap.width, bitmap.height) {
        return Err(LinkError::invalid_frame(format!(
            "region {:?} outside {}x{} bitmap",
            rect, bitmap.width, bitmap.height
        )));
    }
    let mut data = Vec::with_capacity(rect.byte_len());
    for y in rect.y..rect.y + rect.height {
        let row = bitmap.row(y);
        for pixel in &row[rect.x as usize..rect.x as usize + rect.width as usize] {
            data.extend_from_slice(&pixel.to_le_bytes());
        }
    }
    Ok(Frame::from_parts(rect, FrameKind::Dirty, data))
}

/// Unpack a frame's bytes back into pixels.
pub fn decode_frame(frame: &Frame) -> Vec<Rgb565> {
    decode_pixels(frame.data())
}

/// Unpack RGB565 LE bytes. A trailing odd byte is ignored.
pub fn decode_pixels(bytes: &[u8]) -> Vec<Rgb565> {
    bytes.chunks_exact(BYTES_PER_PIXEL).map(|px| Rgb565::from_le_bytes([px[0], px[1]])).collect()
}

impl Frame {
    // Codec output always satisfies the length invariant.
    fn from_parts(rect: Rect, kind: FrameKind, data: Vec<u8>) -> Frame {
        debug_assert_eq!(data.len(), rect.byte_len());
        match Frame::new(rect, kind, data) {
            Ok(frame) => frame,
            Err(err) => unreachable!("codec produced an inconsistent frame: {err}"),
        }
    }
}
