use passgate_core::{SelectionPolicy, Threshold};
use passgate_doc::{IngestConfig, QrPayload, RasterizeConfig, TesseractCli};
use passgate_hw::CaptureSettings;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Which message bus the service registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(format!("unknown bus: {other}")),
        }
    }
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Root of the `uploads/` and `results/` working area.
    pub data_dir: PathBuf,
    /// Euclidean distance below which faces match. Fixed for the daemon's lifetime.
    pub face_threshold: Threshold,
    pub sweep_steps: usize,
    pub sweep_pause_ms: u64,
    pub working_brightness: f32,
    pub settle_ms: u64,
    /// Budget for sweep + settle + capture.
    pub capture_timeout_secs: u64,
    /// Whether brightness sweep frames are kept in the run directory.
    pub save_sweep_frames: bool,
    pub face_selection: SelectionPolicy,
    pub tesseract: PathBuf,
    pub pdftoppm: PathBuf,
    pub pdf_dpi: u32,
    pub qr_payload: QrPayload,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `PASSGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`. Unparseable values fall back to
    /// their defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = lookup("PASSGATE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(passgate_core::default_model_dir);

        let data_dir = lookup("PASSGATE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_data_dir(&lookup));

        let face_threshold = match parsed::<f64>(&lookup, "PASSGATE_FACE_THRESHOLD") {
            Some(value) => Threshold::new(value).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring PASSGATE_FACE_THRESHOLD");
                Threshold::default()
            }),
            None => Threshold::default(),
        };

        Self {
            camera_device: lookup("PASSGATE_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            model_dir,
            data_dir,
            face_threshold,
            sweep_steps: parsed(&lookup, "PASSGATE_SWEEP_STEPS").unwrap_or(11),
            sweep_pause_ms: parsed(&lookup, "PASSGATE_SWEEP_PAUSE_MS").unwrap_or(300),
            working_brightness: parsed::<f32>(&lookup, "PASSGATE_WORKING_BRIGHTNESS")
                .map(|b| b.clamp(0.0, 1.0))
                .unwrap_or(0.6),
            settle_ms: parsed(&lookup, "PASSGATE_SETTLE_MS").unwrap_or(2000),
            capture_timeout_secs: parsed(&lookup, "PASSGATE_CAPTURE_TIMEOUT_SECS").unwrap_or(15),
            save_sweep_frames: lookup("PASSGATE_SAVE_SWEEP_FRAMES")
                .map(|v| v != "0")
                .unwrap_or(true),
            face_selection: parsed(&lookup, "PASSGATE_FACE_SELECTION").unwrap_or_default(),
            tesseract: lookup("PASSGATE_TESSERACT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tesseract")),
            pdftoppm: lookup("PASSGATE_PDFTOPPM")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("pdftoppm")),
            pdf_dpi: parsed(&lookup, "PASSGATE_PDF_DPI").unwrap_or(300),
            qr_payload: parsed(&lookup, "PASSGATE_QR_PAYLOAD").unwrap_or_default(),
            bus: parsed(&lookup, "PASSGATE_BUS").unwrap_or(BusKind::Session),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        model_path(&self.model_dir, "det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        model_path(&self.model_dir, "w600k_r50.onnx")
    }

    /// Path to the BlazeFace short-range detection model.
    pub fn blazeface_model_path(&self) -> String {
        model_path(&self.model_dir, "face_detection_short_range.onnx")
    }

    /// Path to the unaligned crop embedding model.
    pub fn crop_model_path(&self) -> String {
        model_path(&self.model_dir, "mobilefacenet.onnx")
    }

    /// Capture settings for one run, writing sweep frames to `run_dir` if enabled.
    pub fn capture_settings(&self, run_dir: &Path) -> CaptureSettings {
        CaptureSettings {
            sweep_steps: self.sweep_steps,
            sweep_pause: Duration::from_millis(self.sweep_pause_ms),
            working_brightness: self.working_brightness,
            settle: Duration::from_millis(self.settle_ms),
            timeout: Duration::from_secs(self.capture_timeout_secs),
            diagnostics_dir: self.save_sweep_frames.then(|| run_dir.to_path_buf()),
        }
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            rasterize: RasterizeConfig {
                pdftoppm: self.pdftoppm.clone(),
                dpi: self.pdf_dpi,
                timeout: TOOL_TIMEOUT,
            },
            qr_payload: self.qr_payload,
        }
    }

    pub fn text_recognizer(&self) -> TesseractCli {
        TesseractCli::new(self.tesseract.clone(), TOOL_TIMEOUT)
    }
}

fn model_path(dir: &Path, file: &str) -> String {
    dir.join(file).to_string_lossy().into_owned()
}

fn default_data_dir(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("XDG_DATA_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("passgate")
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}
