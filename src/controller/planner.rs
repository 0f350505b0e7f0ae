//! Full-or-dirty frame selection

use crate::codec::{Bitmap, dirty_bounds, encode_full, encode_region};
use crate::types::Frame;
use crate::{LinkError, Result};

/// Chooses how to encode each bitmap against what the panel already shows.
///
/// Sends a full frame first and after every [`invalidate`](Self::invalidate),
/// and whenever the changed area is larger than `max_dirty_ratio` of the
/// panel. Otherwise only the changed rectangle is encoded.
#[derive(Debug, Clone)]
pub struct FramePlanner {
    width: u16,
    height: u16,
    max_dirty_ratio: f64,
    shown: Option<Bitmap>,
    force_full: bool,
}

impl FramePlanner {
    pub fn new(width: u16, height: u16, max_dirty_ratio: f64) -> Self {
        Self { width, height, max_dirty_ratio, shown: None, force_full: true }
    }

    /// Encode `bitmap`, or `None` when the panel already shows it.
    pub fn plan(&self, bitmap: &Bitmap) -> Result<Option<Frame>> {
        if bitmap.width() != self.width || bitmap.height() != self.height {
            return Err(LinkError::invalid_frame(format!(
                "bitmap is {}x{}, panel is {}x{}",
                bitmap.width(),
                bitmap.height(),
                self.width,
                self.height
            )));
        }

        let shown = match &self.shown {
            Some(shown) if !self.force_full => shown,
            _ => return Ok(Some(encode_full(bitmap))),
        };

        match dirty_bounds(shown, bitmap)? {
            None => Ok(None),
            Some(rect) => {
                let ratio = rect.area() as f64 / bitmap.bounds().area() as f64;
                if ratio > self.max_dirty_ratio {
                    Ok(Some(encode_full(bitmap)))
                } else {
                    encode_region(bitmap, rect).map(Some)
                }
            }
        }
    }

    /// Record that `bitmap` is now on the panel.
    pub fn commit(&mut self, bitmap: Bitmap) {
        self.shown = Some(bitmap);
        self.force_full = false;
    }

    /// Forget what the panel shows; the next frame is full.
    pub fn invalidate(&mut self) {
        self.force_full = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Rgb565;
    use crate::types::{FrameKind, Rect};

    #[test]
    fn full_then_dirty_then_full_after_invalidate() {
        let mut planner = FramePlanner::new(800, 480, 0.35);
        let mut bitmap = Bitmap::filled(800, 480, Rgb565::BLACK);

        let first = planner.plan(&bitmap).unwrap().unwrap();
        assert_eq!(first.kind(), FrameKind::Full);
        planner.commit(bitmap.clone());

        assert!(planner.plan(&bitmap).unwrap().is_none());

        bitmap.fill_rect(Rect::new(200, 100, 100, 50), Rgb565::WHITE);
        let dirty = planner.plan(&bitmap).unwrap().unwrap();
        assert_eq!(dirty.kind(), FrameKind::Dirty);
        assert_eq!(dirty.rect(), Rect::new(200, 100, 100, 50));

        planner.invalidate();
        assert!(planner.plan(&bitmap).unwrap().unwrap().is_full());
    }

    #[test]
    fn large_changes_go_out_as_full_frames() {
        let mut planner = FramePlanner::new(100, 100, 0.35);
        let mut bitmap = Bitmap::filled(100, 100, Rgb565::BLACK);
        planner.commit(bitmap.clone());

        bitmap.fill_rect(Rect::new(0, 0, 60, 60), Rgb565::WHITE);
        assert!(planner.plan(&bitmap).unwrap().unwrap().is_full());
    }

    #[test]
    fn wrong_size_bitmap_is_rejected() {
        let planner = FramePlanner::new(800, 480, 0.35);
        let result = planner.plan(&Bitmap::filled(480, 800, Rgb565::BLACK));
        assert!(matches!(result, Err(LinkError::InvalidFrame { .. })));
    }
}
