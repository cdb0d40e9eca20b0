//! Live capture backed by the V4L2 camera.

use crate::config::Config;
use image::DynamicImage;
use passgate_core::{CaptureUnavailable, LiveCapture};
use passgate_doc::RunDir;
use passgate_hw::{Camera, CaptureSettings};

/// Produces the live capture source for one run.
pub trait CameraFactory: Send {
    fn for_run(&self, run: &RunDir) -> Box<dyn LiveCapture>;
}

/// Opens the configured device for each run.
pub struct V4lCameraFactory {
    config: Config,
}

impl V4lCameraFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl CameraFactory for V4lCameraFactory {
    fn for_run(&self, run: &RunDir) -> Box<dyn LiveCapture> {
        Box::new(CameraCapture {
            device: self.config.camera_device.clone(),
            settings: self.config.capture_settings(&run.path),
        })
    }
}

/// Opens the camera, runs the brightness-stabilized capture and releases the
/// device before returning.
pub struct CameraCapture {
    device: String,
    settings: CaptureSettings,
}

impl LiveCapture for CameraCapture {
    fn capture(&mut self) -> Result<DynamicImage, CaptureUnavailable> {
        let camera = Camera::open(&self.device).map_err(|e| CaptureUnavailable(e.to_string()))?;
        tracing::info!(
            device = %self.device,
            width = camera.width,
            height = camera.height,
            fourcc = ?camera.fourcc,
            "camera opened for capture"
        );

        let frame = camera
            .capture_stabilized(&self.settings)
            .map_err(|e| CaptureUnavailable(e.to_string()))?;
        drop(camera);

        let image = frame.to_image().map_err(|e| CaptureUnavailable(e.to_string()))?;
        Ok(DynamicImage::ImageLuma8(image))
    }
}
