//! Convert an uploaded document into the single PNG the rest of the run uses.

use crate::tool;
use crate::DocumentError;
use image::{DynamicImage, ImageReader};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the rasterized document inside a run directory.
pub const DOCUMENT_IMAGE: &str = "passport_image.png";

const PDF_MAGIC: &[u8] = b"%PDF-";

/// How PDFs are rasterized.
#[derive(Debug, Clone)]
pub struct RasterizeConfig {
    pub pdftoppm: PathBuf,
    pub dpi: u32,
    pub timeout: Duration,
}

impl Default for RasterizeConfig {
    fn default() -> Self {
        Self {
            pdftoppm: PathBuf::from("pdftoppm"),
            dpi: 300,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Whether `path` is a PDF, judged by extension or leading magic bytes.
pub fn is_pdf(path: &Path) -> bool {
    let by_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
    if by_extension {
        return true;
    }
    let mut head = [0u8; 5];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut head))
        .map(|_| head == PDF_MAGIC)
        .unwrap_or(false)
}

/// Rasterize `input` into `out_dir/passport_image.png` and decode the result.
///
/// PDFs are rendered page 1 only. Any other input must decode as an image.
pub fn rasterize(input: &Path, out_dir: &Path, config: &RasterizeConfig) -> Result<(PathBuf, DynamicImage), DocumentError> {
    let out_path = out_dir.join(DOCUMENT_IMAGE);

    let image = if is_pdf(input) {
        render_first_page(input, &out_path, config)?;
        image::open(&out_path)
            .map_err(|e| DocumentError::Conversion(format!("rendered page is unreadable: {e}")))?
    } else {
        let image = ImageReader::open(input)
            .map_err(|e| DocumentError::Conversion(format!("{}: {e}", input.display())))?
            .with_guessed_format()
            .map_err(|e| DocumentError::Conversion(format!("{}: {e}", input.display())))?
            .decode()
            .map_err(|e| DocumentError::Conversion(format!("{}: {e}", input.display())))?;
        image
            .save_with_format(&out_path, image::ImageFormat::Png)
            .map_err(|source| DocumentError::Image {
                path: out_path.clone(),
                source,
            })?;
        image
    };

    tracing::info!(
        input = %input.display(),
        output = %out_path.display(),
        width = image.width(),
        height = image.height(),
        "document rasterized"
    );
    Ok((out_path, image))
}

fn render_first_page(input: &Path, out_path: &Path, config: &RasterizeConfig) -> Result<(), DocumentError> {
    // pdftoppm appends ".png" to the output root itself.
    let root = out_path.with_extension("");
    let dpi = config.dpi.to_string();
    let args: [&std::ffi::OsStr; 10] = [
        "-png".as_ref(),
        "-r".as_ref(),
        dpi.as_ref(),
        "-f".as_ref(),
        "1".as_ref(),
        "-l".as_ref(),
        "1".as_ref(),
        "-singlefile".as_ref(),
        input.as_os_str(),
        root.as_os_str(),
    ];
    tool::run(&config.pdftoppm, args, config.timeout)
        .map_err(|e| DocumentError::Conversion(e.to_string()))?;

    if !out_path.exists() {
        return Err(DocumentError::Conversion("PDF conversion produced no image".into()));
    }
    Ok(())
}
