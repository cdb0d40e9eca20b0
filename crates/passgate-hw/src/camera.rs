//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// `V4L2_CID_BRIGHTNESS` from `<linux/v4l2-controls.h>`.
pub const V4L2_CID_BRIGHTNESS: u32 = 0x0098_0900;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const DARK_FRAME_PCT: f32 = 0.95;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("control update failed: {0}")]
    ControlFailed(String),
    #[error("capture exceeded its {0:?} budget")]
    CaptureTimeout(Duration),
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
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
    /// 16-bit little-endian grayscale (2 bytes/pixel).
    Y16,
}

/// Device range of the brightness control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrightnessRange {
    pub minimum: i64,
    pub maximum: i64,
    pub step: u64,
}

impl BrightnessRange {
    /// Map a normalized level in [0, 1] onto the device range, snapped to `step`.
    pub fn value_for(&self, level: f32) -> i64 {
        let level = level.clamp(0.0, 1.0) as f64;
        let span = (self.maximum - self.minimum) as f64;
        let raw = self.minimum as f64 + level * span;
        let step = self.step.max(1) as f64;
        let snapped = self.minimum as f64 + ((raw - self.minimum as f64) / step).round() * step;
        (snapped as i64).clamp(self.minimum, self.maximum)
    }
}

/// Brightness-stabilized capture parameters.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Number of evenly spaced levels from 0.0 to 1.0 in the sweep.
    pub sweep_steps: usize,
    /// Pause after each sweep level.
    pub sweep_pause: Duration,
    /// Level held while capturing the usable frame.
    pub working_brightness: f32,
    /// Pause at the working level before capturing.
    pub settle: Duration,
    /// Budget for the whole sweep + settle + capture sequence.
    pub timeout: Duration,
    /// Where to write `brightness_X.X.png` sweep frames, if anywhere.
    pub diagnostics_dir: Option<PathBuf>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            sweep_steps: 11,
            sweep_pause: Duration::from_millis(300),
            working_brightness: 0.6,
            settle: Duration::from_secs(2),
            timeout: Duration::from_secs(15),
            diagnostics_dir: None,
        }
    }
}

/// Evenly spaced sweep levels from 0.0 to 1.0 inclusive.
pub fn sweep_levels(steps: usize) -> Vec<f32> {
    match steps {
        0 => Vec::new(),
        1 => vec![0.0],
        n => (0..n).map(|i| i as f32 / (n - 1) as f32).collect(),
    }
}

/// File name used for a diagnostic sweep frame.
pub fn sweep_frame_name(level: f32) -> String {
    format!("brightness_{level:.1}.png")
}

/// Time left of `timeout` after `elapsed`, or `None` once it is used up.
pub fn remaining_budget(elapsed: Duration, timeout: Duration) -> Option<Duration> {
    timeout.checked_sub(elapsed).filter(|left| !left.is_zero())
}

/// Brightness is best effort: a rejected control is logged and the capture
/// goes on. Any other error still ends it.
fn tolerate_control_failure(result: Result<(), CameraError>) -> Result<(), CameraError> {
    match result {
        Err(CameraError::ControlFailed(reason)) => {
            tracing::warn!(%reason, "brightness control rejected, continuing");
            Ok(())
        }
        other => other,
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    brightness: Option<BrightnessRange>,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; accept GREY or Y16 if the driver insists.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;

        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            PixelFormat::Y16
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        let brightness = Self::query_brightness(&device);
        match brightness {
            Some(range) => tracing::debug!(?range, "brightness control available"),
            None => tracing::warn!(device = device_path, "device has no brightness control, sweep will not change exposure"),
        }

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
            brightness,
        })
    }

    fn query_brightness(device: &Device) -> Option<BrightnessRange> {
        let controls = device
            .query_controls()
            .map_err(|e| tracing::debug!(error = %e, "failed to query controls"))
            .ok()?;
        controls
            .into_iter()
            .find(|c| c.id == V4L2_CID_BRIGHTNESS)
            .map(|c| BrightnessRange {
                minimum: c.minimum,
                maximum: c.maximum,
                step: c.step,
            })
    }

    /// Set brightness to a normalized level in [0, 1].
    ///
    /// A device without a brightness control is left untouched.
    pub fn set_brightness(&self, level: f32) -> Result<(), CameraError> {
        let Some(range) = self.brightness else {
            return Ok(());
        };
        let value = range.value_for(level);
        self.device
            .set_control(Control {
                id: V4L2_CID_BRIGHTNESS,
                value: Value::Integer(value),
            })
            .map_err(|e| CameraError::ControlFailed(format!("brightness {level:.1} ({value}): {e}")))?;
        tracing::debug!(level, value, "brightness set");
        Ok(())
    }

    /// Capture a single frame, converting to grayscale if needed.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        self.capture_frame_within(None)
    }

    /// Capture a single frame, waiting at most `limit` for the driver to
    /// hand over a buffer.
    fn capture_frame_within(&self, limit: Option<Duration>) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;
        if let Some(limit) = limit {
            stream.set_timeout(limit);
        }

        let (buf, meta) = stream.next().map_err(|e| match (e.kind(), limit) {
            (io::ErrorKind::TimedOut, Some(limit)) => CameraError::CaptureTimeout(limit),
            _ => CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")),
        })?;

        let gray = self.buf_to_grayscale(buf)?;
        let is_dark = frame::is_dark_frame(&gray, DARK_FRAME_PCT);

        Ok(Frame {
            data: gray,
            width: self.width,
            height: self.height,
            timestamp: Instant::now(),
            sequence: meta.sequence,
            is_dark,
        })
    }

    /// Sweep brightness, settle at the working level, then capture one frame.
    ///
    /// Sweep frames are diagnostic only and are written to
    /// `settings.diagnostics_dir` when set. Every wait, including the frame
    /// dequeue, is bounded by what is left of `settings.timeout`; running out
    /// fails with `CaptureTimeout`. A rejected brightness control only logs.
    pub fn capture_stabilized(&self, settings: &CaptureSettings) -> Result<Frame, CameraError> {
        let started = Instant::now();
        let remaining = || {
            remaining_budget(started.elapsed(), settings.timeout)
                .ok_or(CameraError::CaptureTimeout(settings.timeout))
        };

        for level in sweep_levels(settings.sweep_steps) {
            tolerate_control_failure(self.set_brightness(level))?;
            std::thread::sleep(settings.sweep_pause.min(remaining()?));

            if let Some(dir) = &settings.diagnostics_dir {
                self.save_sweep_frame(dir, level, remaining()?);
            }
        }

        tolerate_control_failure(self.set_brightness(settings.working_brightness))?;
        std::thread::sleep(settings.settle.min(remaining()?));

        let frame = self
            .capture_frame_within(Some(remaining()?))
            .map_err(|e| match e {
                CameraError::CaptureTimeout(_) => CameraError::CaptureTimeout(settings.timeout),
                other => other,
            })?;

        if frame.is_dark {
            tracing::warn!(
                seq = frame.sequence,
                brightness = frame.avg_brightness(),
                "usable frame is mostly dark"
            );
        }
        tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "stabilized capture complete");
        Ok(frame)
    }

    fn save_sweep_frame(&self, dir: &Path, level: f32, limit: Duration) {
        let path = dir.join(sweep_frame_name(level));
        match self.capture_frame_within(Some(limit)) {
            Ok(f) => {
                if let Err(e) = f.save_png(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to save sweep frame");
                }
            }
            Err(e) => tracing::warn!(level, error = %e, "failed to capture sweep frame"),
        }
    }

    /// Convert a raw buffer to grayscale based on the negotiated format.
    fn buf_to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let pixels = (self.width * self.height) as usize;

        match self.pixel_format {
            PixelFormat::Grey => {
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("Y16 conversion failed: {e}"))),
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_levels_eleven_steps() {
        let levels = sweep_levels(11);
        assert_eq!(levels.len(), 11);
        assert_eq!(levels[0], 0.0);
        assert_eq!(levels[10], 1.0);
        assert!((levels[6] - 0.6).abs() < 1e-6);
        assert!(levels.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_sweep_levels_degenerate() {
        assert!(sweep_levels(0).is_empty());
        assert_eq!(sweep_levels(1), vec![0.0]);
    }

    #[test]
    fn test_sweep_frame_names() {
        let names: Vec<_> = sweep_levels(11).into_iter().map(sweep_frame_name).collect();
        assert_eq!(names[0], "brightness_0.0.png");
        assert_eq!(names[3], "brightness_0.3.png");
        assert_eq!(names[10], "brightness_1.0.png");
    }

    #[test]
    fn test_brightness_mapping() {
        let range = BrightnessRange { minimum: -64, maximum: 64, step: 1 };
        assert_eq!(range.value_for(0.0), -64);
        assert_eq!(range.value_for(0.5), 0);
        assert_eq!(range.value_for(1.0), 64);
        assert_eq!(range.value_for(2.0), 64);
        assert_eq!(range.value_for(-1.0), -64);
    }

    #[test]
    fn test_brightness_mapping_snaps_to_step() {
        let range = BrightnessRange { minimum: 0, maximum: 255, step: 10 };
        assert_eq!(range.value_for(0.6), 150);
        assert_eq!(range.value_for(1.0), 255);
    }

    #[test]
    fn test_default_settings() {
        let s = CaptureSettings::default();
        assert_eq!(s.sweep_steps, 11);
        assert_eq!(s.working_brightness, 0.6);
        assert!(s.timeout > s.settle + s.sweep_pause * s.sweep_steps as u32);
    }

    #[test]
    fn test_remaining_budget() {
        let timeout = Duration::from_secs(15);
        assert_eq!(remaining_budget(Duration::ZERO, timeout), Some(timeout));
        assert_eq!(
            remaining_budget(Duration::from_millis(14_250), timeout),
            Some(Duration::from_millis(750))
        );
        assert_eq!(remaining_budget(timeout, timeout), None);
        assert_eq!(remaining_budget(Duration::from_secs(20), timeout), None);
    }

    #[test]
    fn test_frame_wait_never_exceeds_budget() {
        // A settle longer than the whole budget is cut short.
        let s = CaptureSettings { settle: Duration::from_secs(30), ..CaptureSettings::default() };
        let left = remaining_budget(Duration::from_secs(5), s.timeout).unwrap();
        assert_eq!(s.settle.min(left), Duration::from_secs(10));
    }

    #[test]
    fn test_rejected_brightness_control_is_not_fatal() {
        let rejected = Err(CameraError::ControlFailed("brightness 0.3 (-26): EINVAL".into()));
        assert!(tolerate_control_failure(rejected).is_ok());
        assert!(tolerate_control_failure(Ok(())).is_ok());
    }

    #[test]
    fn test_read_failures_still_end_capture() {
        let read = Err(CameraError::CaptureFailed("failed to dequeue buffer".into()));
        assert!(matches!(tolerate_control_failure(read), Err(CameraError::CaptureFailed(_))));

        let timeout = Err(CameraError::CaptureTimeout(Duration::from_secs(15)));
        assert!(matches!(tolerate_control_failure(timeout), Err(CameraError::CaptureTimeout(_))));
    }
}
