//! On-disk working area: stored uploads and per-run result directories.

use crate::DocumentError;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const UPLOADS: &str = "uploads";
const RESULTS: &str = "results";
const FALLBACK_NAME: &str = "upload";

/// Root directory holding `uploads/` and `results/`.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

/// Result directory for one run, `results/<uuid>/`.
#[derive(Debug, Clone)]
pub struct RunDir {
    pub id: Uuid,
    pub path: PathBuf,
}

impl RunDir {
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Workspace {
    /// Open (creating if needed) the workspace rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, DocumentError> {
        let ws = Self { root: root.into() };
        create_dir(&ws.uploads_dir())?;
        create_dir(&ws.results_dir())?;
        tracing::debug!(root = %ws.root.display(), "workspace ready");
        Ok(ws)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join(UPLOADS)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join(RESULTS)
    }

    /// Copy `source` into `uploads/` as `<run id>-<sanitized name>`.
    ///
    /// Names are unique per run, so re-submitting a file that already lives
    /// in `uploads/` copies it rather than overwriting it in place.
    pub fn store_upload(&self, source: &Path, run: &RunDir) -> Result<PathBuf, DocumentError> {
        let dest = self.uploads_dir().join(upload_name(source, run));
        fs::copy(source, &dest).map_err(|source_err| DocumentError::Io {
            path: source.to_path_buf(),
            source: source_err,
        })?;
        tracing::info!(from = %source.display(), to = %dest.display(), "upload stored");
        Ok(dest)
    }

    /// Create a fresh, uniquely named result directory.
    pub fn new_run(&self) -> Result<RunDir, DocumentError> {
        let id = Uuid::new_v4();
        let path = self.results_dir().join(id.to_string());
        create_dir(&path)?;
        Ok(RunDir { id, path })
    }

    /// Remove everything under `uploads/` and `results/`, leaving both empty.
    pub fn cleanup(&self) -> Result<(), DocumentError> {
        for dir in [self.uploads_dir(), self.results_dir()] {
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(|source| DocumentError::Io {
                    path: dir.clone(),
                    source,
                })?;
            }
            create_dir(&dir)?;
        }
        tracing::info!(root = %self.root.display(), "uploads and results cleaned up");
        Ok(())
    }
}

fn upload_name(source: &Path, run: &RunDir) -> String {
    let name = source
        .file_name()
        .map(|n| sanitize_filename(&n.to_string_lossy()))
        .unwrap_or_else(|| FALLBACK_NAME.to_string());
    format!("{}-{name}", run.id)
}

fn create_dir(path: &Path) -> Result<(), DocumentError> {
    fs::create_dir_all(path).map_err(|source| DocumentError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Reduce an uploaded file name to a safe ASCII basename.
///
/// Path separators and whitespace become `_`, anything outside
/// `[A-Za-z0-9._-]` is dropped, and leading/trailing `.` and `_` are trimmed.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter_map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '-' | '_' => Some(c),
            '/' | '\\' => Some('_'),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}
