use crate::capture::{CameraFactory, V4lCameraFactory};
use crate::config::Config;
use image::DynamicImage;
use passgate_core::{
    ExtractionMethod, FaceLocator, FallbackLocator, LocatorError, OutcomeRecord, PrimaryLocator,
    VerificationReport, Verifier, VerifyError,
};
use passgate_doc::{DocumentError, IngestConfig, RunDir, TextRecognizer, Workspace};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub const DOCUMENT_FACE: &str = "passport_face.png";
pub const LIVE_FACE: &str = "live_face.png";
pub const LIVE_FRAME: &str = "live_frame.png";
pub const OUTCOME_FILE: &str = "outcome.json";

const GENERIC_FAILURE: &str = "Something went wrong during processing";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no such file: {0}")]
    MissingUpload(PathBuf),
    #[error("no face detected in document")]
    NoDocumentFace,
    #[error("document error: {0}")]
    Document(#[from] DocumentError),
    #[error("locator error: {0}")]
    Locator(#[from] LocatorError),
    #[error("verification error: {0}")]
    Verify(#[from] VerifyError),
    #[error("failed to write {path}: {source}")]
    Artifact {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode outcome: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Message safe to hand back to callers. Details stay in the log.
    pub fn public_message(&self) -> &'static str {
        match self {
            EngineError::MissingUpload(_) => "No file uploaded",
            EngineError::NoDocumentFace => "No face detected in document",
            EngineError::Document(DocumentError::PassportNumberNotFound) => "Passport number not found",
            EngineError::Document(DocumentError::Conversion(_)) => "Failed to convert document to image",
            _ => GENERIC_FAILURE,
        }
    }
}

/// Envelope returned for every completed run, including ones that ended
/// without a comparison.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResponse {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passport_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    pub face_image: Option<String>,
    pub real_time_face: Option<String>,
    pub verification_result: String,
    pub distance_score: Option<f64>,
    pub confidence: String,
    pub fallback_used: bool,
}

/// Contents of `outcome.json`.
#[derive(Serialize)]
struct OutcomeFile {
    run_id: String,
    completed_at: String,
    threshold: f64,
    extraction_method: Option<ExtractionMethod>,
    #[serde(flatten)]
    outcome: OutcomeRecord,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Process {
        path: PathBuf,
        reply: oneshot::Sender<Result<ProcessResponse, EngineError>>,
    },
    Verify {
        path: PathBuf,
        reply: oneshot::Sender<Result<ProcessResponse, EngineError>>,
    },
    Cleanup {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Ingest a document and verify its face against a live capture.
    pub async fn process_document(&self, path: PathBuf) -> Result<ProcessResponse, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Process { path, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Verify a document image against a live capture, skipping OCR.
    pub async fn verify(&self, path: PathBuf) -> Result<ProcessResponse, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Verify { path, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Remove all uploads and results.
    pub async fn cleanup(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Cleanup { reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    async fn send(&self, req: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(req).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Load both locators and open the workspace, then start the engine thread.
///
/// Fails fast at startup if a model or the data directory is unavailable.
/// The camera is opened per run, not here.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let primary = PrimaryLocator::load(
        &config.scrfd_model_path(),
        &config.arcface_model_path(),
        config.face_selection,
    )?;
    let fallback = FallbackLocator::load(
        &config.blazeface_model_path(),
        &config.crop_model_path(),
        config.face_selection,
    )?;
    let workspace = Workspace::open(&config.data_dir)?;
    tracing::info!(root = %workspace.root().display(), "workspace opened");

    let engine = Engine {
        verifier: Verifier::new(primary, fallback, config.face_threshold),
        workspace,
        ingest: config.ingest_config(),
        ocr: Box::new(config.text_recognizer()),
        cameras: Box::new(V4lCameraFactory::new(config.clone())),
    };
    start(engine)
}

/// Run `engine` on a dedicated OS thread. Requests are handled one at a time,
/// so no two runs ever hold the camera at once.
fn start<P, F>(mut engine: Engine<P, F>) -> Result<EngineHandle, EngineError>
where
    P: FaceLocator + Send + 'static,
    F: FaceLocator + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("passgate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Process { path, reply } => {
                        let _ = reply.send(engine.process_document(&path));
                    }
                    EngineRequest::Verify { path, reply } => {
                        let _ = reply.send(engine.verify_document_image(&path));
                    }
                    EngineRequest::Cleanup { reply } => {
                        let _ = reply.send(engine.cleanup());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

struct Engine<P, F> {
    verifier: Verifier<P, F>,
    workspace: Workspace,
    ingest: IngestConfig,
    ocr: Box<dyn TextRecognizer + Send>,
    cameras: Box<dyn CameraFactory>,
}

impl<P: FaceLocator, F: FaceLocator> Engine<P, F> {
    fn process_document(&mut self, upload: &Path) -> Result<ProcessResponse, EngineError> {
        if !upload.is_file() {
            return Err(EngineError::MissingUpload(upload.to_path_buf()));
        }
        let run = self.workspace.new_run()?;
        tracing::info!(run = %run.id, upload = %upload.display(), "processing document");

        let stored = self.workspace.store_upload(upload, &run)?;
        let doc = passgate_doc::ingest(&stored, &run.path, &self.ingest, self.ocr.as_ref())?;

        let mut response = self.verify_image(&doc.image, &run)?;
        response.passport_number = Some(doc.passport_number);
        response.hash = Some(doc.hash);
        response.qr_code = Some(doc.qr_path.display().to_string());
        Ok(response)
    }

    fn verify_document_image(&mut self, path: &Path) -> Result<ProcessResponse, EngineError> {
        if !path.is_file() {
            return Err(EngineError::MissingUpload(path.to_path_buf()));
        }
        let run = self.workspace.new_run()?;
        tracing::info!(run = %run.id, image = %path.display(), "verifying document image");

        let (_, image) = passgate_doc::rasterize::rasterize(path, &run.path, &self.ingest.rasterize)?;
        self.verify_image(&image, &run)
    }

    fn verify_image(&mut self, document: &DynamicImage, run: &RunDir) -> Result<ProcessResponse, EngineError> {
        // A faceless document never reaches the camera sweep.
        if !self.verifier.document_has_face(document)? {
            tracing::info!(run = %run.id, "no face detected in document");
            return Err(EngineError::NoDocumentFace);
        }

        let report = {
            let mut camera = self.cameras.for_run(run);
            self.verifier.verify(document, camera.as_mut())?
        };
        tracing::debug!(run = %run.id, stages = ?report.stages, "verification stages");

        let (face_image, real_time_face) = write_artifacts(&report, run, self.verifier.threshold().value())?;
        let outcome = &report.outcome;

        Ok(ProcessResponse {
            run_id: run.id.to_string(),
            passport_number: None,
            hash: None,
            qr_code: None,
            face_image: face_image.map(|p| p.display().to_string()),
            real_time_face: real_time_face.map(|p| p.display().to_string()),
            verification_result: outcome.verdict_text(),
            distance_score: outcome.distance(),
            confidence: outcome.confidence_text(),
            fallback_used: outcome.fallback_used(),
        })
    }

    fn cleanup(&mut self) -> Result<(), EngineError> {
        self.workspace.cleanup()?;
        Ok(())
    }
}

/// Write face crops, the live frame and `outcome.json` into the run directory.
/// Returns the paths of the document and live face crops, when present.
fn write_artifacts(
    report: &VerificationReport,
    run: &RunDir,
    threshold: f64,
) -> Result<(Option<PathBuf>, Option<PathBuf>), EngineError> {
    if let Some(frame) = &report.live_frame {
        save_png(frame, &run.file(LIVE_FRAME))?;
    }

    let face_image = match &report.document_face {
        Some(face) => Some(save_png(&face.region, &run.file(DOCUMENT_FACE))?),
        None => None,
    };
    let real_time_face = match &report.live_face {
        Some(face) => Some(save_png(&face.region, &run.file(LIVE_FACE))?),
        None => None,
    };

    let record = OutcomeFile {
        run_id: run.id.to_string(),
        completed_at: chrono::Utc::now().to_rfc3339(),
        threshold,
        extraction_method: report.document_face.as_ref().map(|f| f.method),
        outcome: report.outcome.record(),
    };
    let path = run.file(OUTCOME_FILE);
    std::fs::write(&path, serde_json::to_vec_pretty(&record)?).map_err(|source| EngineError::Io {
        path: path.clone(),
        source,
    })?;

    Ok((face_image, real_time_face))
}

fn save_png(image: &DynamicImage, path: &Path) -> Result<PathBuf, EngineError> {
    image
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|source| EngineError::Artifact {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use passgate_core::{
        BoundingBox, CaptureUnavailable, Embedding, FaceSample, FaceSource, LiveCapture, Threshold,
    };

    /// Finds a face in every image and embeds it by source.
    struct FakeLocator {
        method: ExtractionMethod,
        document: Option<Vec<f32>>,
        live: Option<Vec<f32>>,
    }

    impl FaceLocator for FakeLocator {
        fn method(&self) -> ExtractionMethod {
            self.method
        }

        fn locate(&mut self, image: &DynamicImage, source: FaceSource) -> Result<Option<FaceSample>, LocatorError> {
            let values = match source {
                FaceSource::Document => self.document.clone(),
                FaceSource::Live => self.live.clone(),
            };
            Ok(values.map(|values| FaceSample {
                source,
                method: self.method,
                bbox: BoundingBox {
                    x: 0.0, y: 0.0, width: 2.0, height: 2.0, confidence: 0.9, landmarks: None,
                },
                region: image.crop_imm(0, 0, 2, 2),
                embedding: Embedding { values, model_version: None },
            }))
        }
    }

    struct FixedText(&'static str);

    impl TextRecognizer for FixedText {
        fn recognize(&self, _image: &Path) -> Result<String, DocumentError> {
            Ok(self.0.to_string())
        }
    }

    struct FakeCameras {
        available: bool,
    }

    struct FakeCamera {
        available: bool,
    }

    impl LiveCapture for FakeCamera {
        fn capture(&mut self) -> Result<DynamicImage, CaptureUnavailable> {
            if self.available {
                Ok(DynamicImage::new_luma8(8, 8))
            } else {
                Err(CaptureUnavailable("device not found: /dev/video9".into()))
            }
        }
    }

    impl CameraFactory for FakeCameras {
        fn for_run(&self, _run: &RunDir) -> Box<dyn LiveCapture> {
            Box::new(FakeCamera { available: self.available })
        }
    }

    fn engine(root: &Path, live: Option<Vec<f32>>, camera: bool, text: &'static str) -> Engine<FakeLocator, FakeLocator> {
        engine_with(root, Some(vec![0.0, 0.0]), live, camera, text)
    }

    fn engine_with(
        root: &Path,
        document: Option<Vec<f32>>,
        live: Option<Vec<f32>>,
        camera: bool,
        text: &'static str,
    ) -> Engine<FakeLocator, FakeLocator> {
        let primary = FakeLocator {
            method: ExtractionMethod::Primary,
            document,
            live,
        };
        let fallback = FakeLocator {
            method: ExtractionMethod::Fallback,
            document: None,
            live: None,
        };
        Engine {
            verifier: Verifier::new(primary, fallback, Threshold::default()),
            workspace: Workspace::open(root.join("data")).unwrap(),
            ingest: IngestConfig::default(),
            ocr: Box::new(FixedText(text)),
            cameras: Box::new(FakeCameras { available: camera }),
        }
    }

    fn upload(dir: &Path) -> PathBuf {
        let path = dir.join("passport scan.png");
        RgbImage::from_pixel(16, 16, Rgb([90, 90, 90])).save(&path).unwrap();
        path
    }

    #[test]
    fn test_process_document_verified() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), Some(vec![0.0, 0.0]), true, "No. K1234567");
        let response = engine.process_document(&upload(dir.path())).unwrap();

        assert_eq!(response.passport_number.as_deref(), Some("K1234567"));
        assert_eq!(response.hash, Some(passgate_doc::codes::blake3_hex("K1234567")));
        assert_eq!(response.verification_result, "Verified");
        assert_eq!(response.distance_score, Some(0.0));
        assert_eq!(response.confidence, "100.00%");
        assert!(!response.fallback_used);

        let run_dir = engine.workspace.results_dir().join(&response.run_id);
        for name in [DOCUMENT_FACE, LIVE_FACE, LIVE_FRAME, OUTCOME_FILE, "passport_image.png", "passport_qr.png"] {
            assert!(run_dir.join(name).exists(), "missing {name}");
        }
        let stored = engine.workspace.uploads_dir().join(format!("{}-passport_scan.png", response.run_id));
        assert!(stored.exists());

        let outcome: serde_json::Value =
            serde_json::from_slice(&std::fs::read(run_dir.join(OUTCOME_FILE)).unwrap()).unwrap();
        assert_eq!(outcome["verdict"], "verified");
        assert_eq!(outcome["extraction_method"], "primary");
        assert_eq!(outcome["threshold"], 0.6);
    }

    #[test]
    fn test_missing_passport_number() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), Some(vec![0.0, 0.0]), true, "illegible");
        let err = engine.process_document(&upload(dir.path())).unwrap_err();
        assert_eq!(err.public_message(), "Passport number not found");
    }

    #[test]
    fn test_capture_failure_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), Some(vec![0.0, 0.0]), false, "K1234567");
        let response = engine.process_document(&upload(dir.path())).unwrap();

        assert_eq!(response.verification_result, "Error: capture failed");
        assert_eq!(response.distance_score, None);
        assert_eq!(response.confidence, "N/A");
        assert_eq!(response.face_image, None);
        assert_eq!(response.real_time_face, None);
    }

    #[test]
    fn test_no_live_face_anywhere() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), None, true, "K1234567");
        let response = engine.verify_document_image(&upload(dir.path())).unwrap();

        assert_eq!(response.verification_result, "Face not detected in one or both images");
        assert!(response.fallback_used);
        assert_eq!(response.passport_number, None);
        let run_dir = engine.workspace.results_dir().join(&response.run_id);
        assert!(run_dir.join(LIVE_FRAME).exists());
        assert!(!run_dir.join(LIVE_FACE).exists());
    }

    #[test]
    fn test_faceless_document_stops_before_capture() {
        let dir = tempfile::tempdir().unwrap();
        // With the camera down, reaching capture would yield "Error: capture failed".
        let mut engine = engine_with(dir.path(), None, Some(vec![0.0, 0.0]), false, "K1234567");
        let err = engine.process_document(&upload(dir.path())).unwrap_err();

        assert!(matches!(err, EngineError::NoDocumentFace));
        assert_eq!(err.public_message(), "No face detected in document");
    }

    #[test]
    fn test_response_json_omits_document_fields_for_verify() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), Some(vec![1.0, 0.0]), true, "");
        let response = engine.verify_document_image(&upload(dir.path())).unwrap();
        let json = serde_json::to_value(&response).unwrap();

        assert!(json.get("passport_number").is_none());
        assert_eq!(json["verification_result"], "Failed to verify");
        assert_eq!(json["distance_score"], 1.0);
        assert_eq!(json["confidence"], "0.00%");
    }

    #[tokio::test]
    async fn test_handle_maps_conversion_failure() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"definitely not a png").unwrap();

        let handle = start(engine(dir.path(), Some(vec![0.0, 0.0]), true, "")).unwrap();
        let err = handle.verify(broken).await.unwrap_err();
        assert_eq!(err.public_message(), "Failed to convert document to image");

        let err = handle.process_document(dir.path().join("absent.pdf")).await.unwrap_err();
        assert_eq!(err.public_message(), "No file uploaded");
    }

    #[tokio::test]
    async fn test_handle_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let handle = start(engine(dir.path(), Some(vec![0.0, 0.0]), true, "K1234567")).unwrap();
        handle.process_document(upload(dir.path())).await.unwrap();

        handle.cleanup().await.unwrap();
        let results = dir.path().join("data/results");
        assert_eq!(std::fs::read_dir(results).unwrap().count(), 0);
    }
}
