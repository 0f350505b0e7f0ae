//! Single-slot bitmap handoff between the renderer and the tick loop

use std::sync::{Arc, Mutex, MutexGuard};

use crate::codec::Bitmap;

#[derive(Default)]
struct SlotInner {
    bitmap: Option<Bitmap>,
    overwritten: u64,
}

/// Holds at most one bitmap. Publishing replaces whatever was waiting, so
/// the tick loop always sends the freshest image and never builds a backlog.
#[derive(Clone, Default)]
pub struct FrameSlot {
    inner: Arc<Mutex<SlotInner>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Offer a bitmap. Returns `true` if an unsent one was replaced.
    pub fn publish(&self, bitmap: Bitmap) -> bool {
        let mut inner = self.lock();
        let replaced = inner.bitmap.replace(bitmap).is_some();
        if replaced {
            inner.overwritten += 1;
        }
        replaced
    }

    /// Take the waiting bitmap, leaving the slot empty.
    pub fn take(&self) -> Option<Bitmap> {
        self.lock().bitmap.take()
    }

    /// Return a bitmap that could not be sent, unless a newer one arrived.
    pub(crate) fn restore(&self, bitmap: Bitmap) {
        let mut inner = self.lock();
        if inner.bitmap.is_none() {
            inner.bitmap = Some(bitmap);
        }
    }

    pub fn is_pending(&self) -> bool {
        self.lock().bitmap.is_some()
    }

    /// Bitmaps replaced before they were sent.
    pub fn overwritten(&self) -> u64 {
        self.lock().overwritten
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Rgb565;

    #[test]
    fn newest_bitmap_wins() {
        let slot = FrameSlot::new();
        assert!(!slot.publish(Bitmap::filled(2, 2, Rgb565::BLACK)));
        assert!(slot.publish(Bitmap::filled(2, 2, Rgb565::WHITE)));
        assert_eq!(slot.overwritten(), 1);

        let taken = slot.take().unwrap();
        assert_eq!(taken.pixel(0, 0), Some(Rgb565::WHITE));
        assert!(slot.take().is_none());
    }

    #[test]
    fn restore_never_hides_a_newer_bitmap() {
        let slot = FrameSlot::new();
        slot.publish(Bitmap::filled(2, 2, Rgb565::BLACK));
        let old = slot.take().unwrap();

        slot.publish(Bitmap::filled(2, 2, Rgb565::WHITE));
        slot.restore(old.clone());
        assert_eq!(slot.take().unwrap().pixel(0, 0), Some(Rgb565::WHITE));

        slot.restore(old);
        assert!(slot.is_pending());
    }
}
