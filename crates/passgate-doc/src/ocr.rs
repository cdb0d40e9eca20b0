//! Optical character recognition of the rasterized document.

use crate::tool;
use crate::DocumentError;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Read the text printed on an image.
pub trait TextRecognizer {
    fn recognize(&self, image: &Path) -> Result<String, DocumentError>;
}

/// Runs the `tesseract` command-line tool, reading its text from stdout.
#[derive(Debug, Clone)]
pub struct TesseractCli {
    program: PathBuf,
    timeout: Duration,
}

impl TesseractCli {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self::new("tesseract", Duration::from_secs(60))
    }
}

impl TextRecognizer for TesseractCli {
    fn recognize(&self, image: &Path) -> Result<String, DocumentError> {
        let output = tool::run(&self.program, [image.as_os_str(), "stdout".as_ref()], self.timeout)
            .map_err(|e| DocumentError::Ocr(e.to_string()))?;
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        tracing::debug!(image = %image.display(), chars = text.len(), "OCR complete");
        Ok(text)
    }
}
