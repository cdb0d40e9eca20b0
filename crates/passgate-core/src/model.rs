//! Shared ONNX Runtime session loading.

use ort::session::Session;
use std::path::Path;

const INTRA_THREADS: usize = 2;

/// Whether a model file is present on disk.
pub(crate) fn exists(model_path: &str) -> bool {
    Path::new(model_path).exists()
}

/// Open an ONNX model and log its tensor signature.
pub(crate) fn load_session(model_path: &str, kind: &str) -> Result<Session, ort::Error> {
    let session = Session::builder()?
        .with_intra_threads(INTRA_THREADS)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = model_path,
        model = kind,
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );

    Ok(session)
}
