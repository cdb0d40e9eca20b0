//! passgate-hw: live camera capture.
//!
//! V4L2 camera access with a brightness sweep that lets auto-exposure settle
//! before the one usable frame is taken.

pub mod camera;
pub mod frame;

pub use camera::{BrightnessRange, Camera, CameraError, CaptureSettings, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
