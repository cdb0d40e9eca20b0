//! passgate-doc: document ingestion.
//!
//! Turns an uploaded passport scan into a decoded image, the passport number
//! read from it, that number's BLAKE3 digest, and a QR code image.

pub mod codes;
pub mod ocr;
pub mod passport;
pub mod rasterize;
mod tool;
pub mod workspace;

pub use ocr::{TesseractCli, TextRecognizer};
pub use rasterize::{RasterizeConfig, DOCUMENT_IMAGE};
pub use tool::ToolError;
pub use workspace::{RunDir, Workspace};

use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// File name of the QR code inside a run directory.
pub const QR_IMAGE: &str = "passport_qr.png";

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("failed to convert document to image: {0}")]
    Conversion(String),
    #[error("OCR failed: {0}")]
    Ocr(String),
    #[error("passport number not found")]
    PassportNumberNotFound,
    #[error("QR encoding failed: {0}")]
    Qr(String),
    #[error("failed to write image {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// What the QR code encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QrPayload {
    /// The passport number itself.
    #[default]
    Number,
    /// The BLAKE3 hex digest of the passport number.
    Hash,
}

impl FromStr for QrPayload {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "number" => Ok(QrPayload::Number),
            "hash" => Ok(QrPayload::Hash),
            other => Err(format!("unknown QR payload: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestConfig {
    pub rasterize: RasterizeConfig,
    pub qr_payload: QrPayload,
}

/// Everything extracted from one uploaded document.
#[derive(Debug, Clone)]
pub struct IngestedDocument {
    pub image_path: PathBuf,
    pub image: DynamicImage,
    pub passport_number: String,
    pub hash: String,
    pub qr_path: PathBuf,
}

/// Rasterize `upload` into `out_dir`, read the passport number, hash it and
/// write its QR code.
pub fn ingest(
    upload: &Path,
    out_dir: &Path,
    config: &IngestConfig,
    ocr: &dyn TextRecognizer,
) -> Result<IngestedDocument, DocumentError> {
    let (image_path, image) = rasterize::rasterize(upload, out_dir, &config.rasterize)?;

    let text = ocr.recognize(&image_path)?;
    let passport_number = passport::extract_passport_number(&text)
        .ok_or(DocumentError::PassportNumberNotFound)?
        .to_string();

    let hash = codes::blake3_hex(&passport_number);
    tracing::info!(%passport_number, %hash, "passport number extracted");

    let qr_path = out_dir.join(QR_IMAGE);
    let payload = match config.qr_payload {
        QrPayload::Number => passport_number.as_str(),
        QrPayload::Hash => hash.as_str(),
    };
    codes::write_qr(payload, &qr_path)?;

    Ok(IngestedDocument {
        image_path,
        image,
        passport_number,
        hash,
        qr_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    struct FixedText(&'static str);

    impl TextRecognizer for FixedText {
        fn recognize(&self, _image: &Path) -> Result<String, DocumentError> {
            Ok(self.0.to_string())
        }
    }

    fn scan(dir: &Path) -> PathBuf {
        let path = dir.join("scan.png");
        RgbImage::from_pixel(40, 30, Rgb([200, 200, 200])).save(&path).unwrap();
        path
    }

    #[test]
    fn test_ingest_full_chain() {
        let dir = tempfile::tempdir().unwrap();
        let upload = scan(dir.path());
        let ocr = FixedText("P<IND\nPassport No: K1234567\n");

        let doc = ingest(&upload, dir.path(), &IngestConfig::default(), &ocr).unwrap();
        assert_eq!(doc.passport_number, "K1234567");
        assert_eq!(doc.hash, codes::blake3_hex("K1234567"));
        assert_eq!(doc.image_path, dir.path().join(DOCUMENT_IMAGE));
        assert_eq!(doc.qr_path, dir.path().join(QR_IMAGE));
        assert!(doc.qr_path.exists());
        assert_eq!((doc.image.width(), doc.image.height()), (40, 30));
    }

    #[test]
    fn test_ingest_without_number() {
        let dir = tempfile::tempdir().unwrap();
        let upload = scan(dir.path());
        let err = ingest(&upload, dir.path(), &IngestConfig::default(), &FixedText("nothing")).unwrap_err();
        assert!(matches!(err, DocumentError::PassportNumberNotFound));
        assert!(!dir.path().join(QR_IMAGE).exists());
    }

    #[test]
    fn test_qr_payload_from_str() {
        assert_eq!("hash".parse::<QrPayload>(), Ok(QrPayload::Hash));
        assert_eq!("Number".parse::<QrPayload>(), Ok(QrPayload::Number));
        assert!("url".parse::<QrPayload>().is_err());
    }
}
