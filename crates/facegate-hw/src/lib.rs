//! facegate-hw: camera stream acquisition.
//!
//! Abstracts camera streams behind [`CameraSource`] / [`CameraStream`]
//! and provides a V4L2 backend that maps facing directions to devices.

pub mod camera;
pub mod frame;

pub use camera::{
    Camera, CameraSource, CameraStream, CaptureError, DeviceInfo, Facing, PixelFormat, V4l2Source,
};
pub use frame::Frame;
