//! Change detection between consecutive bitmaps

use super::{Bitmap, encode_region};
use crate::types::{Frame, Rect};
use crate::{LinkError, Result};

/// Exact bounding box of every pixel that differs between two bitmaps.
///
/// Returns `None` when the bitmaps are identical. Disjoint changed areas are
/// merged into one enclosing rectangle.
pub fn dirty_bounds(previous: &Bitmap, current: &Bitmap) -> Result<Option<Rect>> {
    if previous.width() != current.width() || previous.height() != current.height() {
        return Err(LinkError::invalid_frame(format!(
            "cannot diff {}x{} against {}x{}",
            previous.width(),
            previous.height(),
            current.width(),
            current.height()
        )));
    }

    let mut bounds: Option<(u16, u16, u16, u16)> = None;

    for y in 0..current.height() {
        let before = previous.row(y);
        let after = current.row(y);
        if before == after {
            continue;
        }

        let Some(first) = before.iter().zip(after).position(|(a, b)| a != b) else {
            continue;
        };
        let last = before.iter().zip(after).rposition(|(a, b)| a != b).unwrap_or(first);
        let (first, last) = (first as u16, last as u16);

        bounds = Some(match bounds {
            None => (first, y, last, y),
            Some((min_x, min_y, max_x, _)) => (min_x.min(first), min_y, max_x.max(last), y),
        });
    }

    Ok(bounds.map(|(min_x, min_y, max_x, max_y)| {
        Rect::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
    }))
}

/// Encode only the changed region of `current`.
///
/// `Ok(None)` means nothing changed and the tick can be skipped.
pub fn encode_dirty(previous: &Bitmap, current: &Bitmap) -> Result<Option<Frame>> {
    match dirty_bounds(previous, current)? {
        Some(rect) => encode_region(current, rect).map(Some),
        None => Ok(None),
    }
}
