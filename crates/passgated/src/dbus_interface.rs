use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.passgate.Verifier1";
pub const OBJECT_PATH: &str = "/org/passgate/Verifier1";

/// D-Bus interface for the passgate verification daemon.
///
/// Bus name: org.passgate.Verifier1
/// Object path: /org/passgate/Verifier1
pub struct VerifierService {
    engine: EngineHandle,
    config: Config,
}

impl VerifierService {
    pub fn new(engine: EngineHandle, config: Config) -> Self {
        Self { engine, config }
    }
}

fn failure(op: &str, err: EngineError) -> zbus::fdo::Error {
    tracing::error!(op, error = %err, "request failed");
    zbus::fdo::Error::Failed(err.public_message().to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| {
        tracing::error!(error = %e, "failed to encode response");
        zbus::fdo::Error::Failed("Something went wrong during processing".into())
    })
}

#[interface(name = "org.passgate.Verifier1")]
impl VerifierService {
    /// Ingest a passport document and verify its photo against a live capture.
    async fn process_document(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "process_document requested");
        let response = self
            .engine
            .process_document(PathBuf::from(path))
            .await
            .map_err(|e| failure("process_document", e))?;
        to_json(&response)
    }

    /// Verify a document image against a live capture without OCR.
    async fn verify(&self, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image_path, "verify requested");
        let response = self
            .engine
            .verify(PathBuf::from(image_path))
            .await
            .map_err(|e| failure("verify", e))?;
        to_json(&response)
    }

    /// Delete all uploads and results.
    async fn cleanup(&self) -> zbus::fdo::Result<String> {
        tracing::info!("cleanup requested");
        self.engine.cleanup().await.map_err(|e| failure("cleanup", e))?;
        to_json(&serde_json::json!({ "message": "All uploads and results cleaned up" }))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.config.camera_device,
            "threshold": self.config.face_threshold.value(),
            "data_dir": self.config.data_dir,
            "face_selection": format!("{:?}", self.config.face_selection),
            "models": {
                "primary": [self.config.scrfd_model_path(), self.config.arcface_model_path()],
                "fallback": [self.config.blazeface_model_path(), self.config.crop_model_path()],
            },
        }))
    }
}
