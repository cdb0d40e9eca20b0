//! BLAKE3 digests and QR code images.

use crate::DocumentError;
use image::Luma;
use qrcode::QrCode;
use std::path::Path;

/// Pixel size of one QR module.
const QR_MODULE_PX: u32 = 10;

/// Lowercase hex BLAKE3 digest of the UTF-8 bytes of `data`.
pub fn blake3_hex(data: &str) -> String {
    blake3::hash(data.as_bytes()).to_hex().to_string()
}

/// Encode `data` as a QR code and write it to `path` as PNG.
pub fn write_qr(data: &str, path: &Path) -> Result<(), DocumentError> {
    let code = QrCode::new(data.as_bytes()).map_err(|e| DocumentError::Qr(e.to_string()))?;
    let image = code
        .render::<Luma<u8>>()
        .module_dimensions(QR_MODULE_PX, QR_MODULE_PX)
        .build();
    image
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|source| DocumentError::Image {
            path: path.to_path_buf(),
            source,
        })?;
    tracing::debug!(path = %path.display(), width = image.width(), "QR code written");
    Ok(())
}
