//! Still-image encoding for kept frames.
//!
//! [`encode_frame`] turns a decoded picture into JPEG, PNG, or WebP bytes.
//! It is CPU-bound; the pipeline runs it on a blocking thread.
//!
//! # Example
//!
//! ```
//! use image::{DynamicImage, RgbImage};
//! use stillcut::{OutputFormat, encode_frame};
//!
//! let image = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
//! let jpeg = encode_frame(&image, OutputFormat::Jpeg, 90)?;
//! assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
//! # Ok::<(), stillcut::ExtractError>(())
//! ```

use std::io::Cursor;

use image::{
    DynamicImage,
    codecs::{jpeg::JpegEncoder, png::PngEncoder, webp::WebPEncoder},
};

use crate::{configuration::OutputFormat, error::ExtractError};

/// Encode `image` as `format`.
///
/// `quality` (0–100) applies to JPEG only; PNG and WebP are lossless.
///
/// # Errors
///
/// Returns [`ExtractError::Encode`] if the encoder rejects the image.
pub fn encode_frame(
    image: &DynamicImage,
    format: OutputFormat,
    quality: u8,
) -> Result<Vec<u8>, ExtractError> {
    let mut buffer = Cursor::new(Vec::new());

    let result = match format {
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
            rgb.write_with_encoder(encoder)
        }
        OutputFormat::Png => image.write_with_encoder(PngEncoder::new(&mut buffer)),
        OutputFormat::WebP => {
            let converted = if image.color().has_alpha() {
                DynamicImage::ImageRgba8(image.to_rgba8())
            } else {
                DynamicImage::ImageRgb8(image.to_rgb8())
            };
            converted.write_with_encoder(WebPEncoder::new_lossless(&mut buffer))
        }
    };
    result.map_err(|error| ExtractError::Encode(format!("{format}: {error}")))?;

    let bytes = buffer.into_inner();
    log::trace!(
        "Encoded {}x{} frame as {format} ({} bytes)",
        image.width(),
        image.height(),
        bytes.len()
    );
    Ok(bytes)
}
