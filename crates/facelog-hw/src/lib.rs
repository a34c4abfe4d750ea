//! facelog-hw — V4L2 camera capture.
//!
//! Opens a capture device, keeps an mmap stream running and converts each
//! raw buffer (YUYV, RGB3 or GREY) to packed RGB.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo};
pub use frame::{Frame, FrameError};
