//! Core types shared across the display pipeline.
//!
//! - [`DeviceSelector`] / [`DeviceDescriptor`] describe which serial port to
//!   open and with which [`LinkParams`]
//! - [`Rect`] and [`Frame`] carry encoded RGB565 pixel regions
//! - [`StreamMetrics`], [`RecoveryStatus`] and [`StreamStatus`] are the
//!   immutable snapshots handed to status observers
//!
//! ```rust
//! use smartscreen::types::{Frame, FrameKind, Rect};
//!
//! let rect = Rect::new(0, 0, 2, 1);
//! let frame = Frame::new(rect, FrameKind::Dirty, vec![0x00, 0xF8, 0xE0, 0x07]).unwrap();
//! assert_eq!(frame.len(), rect.byte_len());
//! ```

mod device;
mod frame;
mod status;

pub use device::{
    DEFAULT_BAUD_RATE, DeviceDescriptor, DeviceSelector, LinkParams, PANEL_HEIGHT, PANEL_WIDTH,
    PRODUCT_ID, Parity, VENDOR_ID,
};
pub use frame::{BYTES_PER_PIXEL, Frame, FrameKind, Rect};
pub use status::{ErrorSnapshot, RecoveryStatus, StreamMetrics, StreamStatus};
