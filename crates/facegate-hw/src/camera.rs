//! Camera streams selected by facing direction, with a V4L2 backend.

use crate::frame::{self, Frame};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera access denied: {0}")]
    DeviceDenied(String),
    #[error("no camera device: {0}")]
    NoDevice(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("stream stopped")]
    Stopped,
}

/// Requested camera direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    /// Front camera, pointing at the user.
    User,
    /// Rear camera, pointing away from the user.
    Environment,
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facing::User => f.write_str("user"),
            Facing::Environment => f.write_str("environment"),
        }
    }
}

/// Source of camera streams.
pub trait CameraSource: Send + Sync {
    fn open(&self, facing: Facing) -> Result<Box<dyn CameraStream>, CaptureError>;
}

/// An acquired camera stream. Owned by exactly one holder.
pub trait CameraStream: Send {
    /// Capture the latest frame.
    fn capture(&mut self) -> Result<Frame, CaptureError>;
    /// Stop all tracks. Idempotent.
    fn stop(&mut self);
    fn is_active(&self) -> bool;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

/// V4L2 camera source mapping each facing direction to a device path.
#[derive(Debug, Clone)]
pub struct V4l2Source {
    pub user_device: String,
    pub environment_device: String,
    /// Frames discarded after opening (AGC/AE stabilization).
    pub warmup_frames: usize,
}

impl V4l2Source {
    pub fn device_for(&self, facing: Facing) -> &str {
        match facing {
            Facing::User => &self.user_device,
            Facing::Environment => &self.environment_device,
        }
    }
}

impl CameraSource for V4l2Source {
    fn open(&self, facing: Facing) -> Result<Box<dyn CameraStream>, CaptureError> {
        let path = self.device_for(facing);
        let mut camera = Camera::open(path)?;
        tracing::info!(
            device = path,
            facing = %facing,
            width = camera.width,
            height = camera.height,
            fourcc = ?camera.fourcc,
            "camera opened"
        );

        if self.warmup_frames > 0 {
            tracing::debug!(count = self.warmup_frames, "discarding warmup frames");
            for _ in 0..self.warmup_frames {
                let _ = camera.capture();
            }
        }
        Ok(Box::new(camera))
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Option<Device>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CaptureError> {
        if !Path::new(device_path).exists() {
            return Err(CaptureError::NoDevice(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                CaptureError::DeviceDenied(format!("{device_path}: {e}"))
            }
            std::io::ErrorKind::NotFound => CaptureError::NoDevice(device_path.to_string()),
            _ if e.raw_os_error() == Some(EBUSY) => CaptureError::DeviceBusy(device_path.to_string()),
            _ => CaptureError::NoDevice(format!("{device_path}: {e}")),
        })?;

        let caps = device.query_caps().map_err(|e| {
            CaptureError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CaptureError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;

        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = 640;
        fmt.height = 480;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CaptureError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"Y16 ") {
            PixelFormat::Y16
        } else {
            return Err(CaptureError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::debug!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            "negotiated format"
        );

        Ok(Self {
            device: Some(device),
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    fn buf_to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, CaptureError> {
        let pixels = (self.width * self.height) as usize;

        let converted = match self.pixel_format {
            PixelFormat::Grey => {
                if buf.len() < pixels {
                    return Err(CaptureError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, self.width, self.height),
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height),
        };
        converted.map_err(|e| CaptureError::CaptureFailed(format!("{:?} conversion: {e}", self.pixel_format)))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

const EBUSY: i32 = 16;

impl CameraStream for Camera {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let device = self.device.as_ref().ok_or(CaptureError::Stopped)?;

        let mut stream = MmapStream::with_buffers(device, BufType::VideoCapture, 4).map_err(|e| {
            CaptureError::CaptureFailed(format!("failed to create mmap stream: {e}"))
        })?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CaptureError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;

        let gray = self.buf_to_grayscale(buf)?;
        Ok(Frame::from_gray(gray, self.width, self.height, sequence))
    }

    fn stop(&mut self) {
        if self.device.take().is_some() {
            tracing::info!(device = %self.device_path, "camera stream stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.device.is_some()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.stop();
    }
}
