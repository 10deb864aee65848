//! Decode/encode helpers around the `image` crate.
//!
//! Encoders write to a hidden temporary sibling and rename it into place, so a
//! reader never observes a half-written derivative.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::gif::GifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat};

use super::ImageProcessingError;

/// Detect the format of an encoded image from its leading bytes.
pub fn detect_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes).ok()
}

/// Read and decode an image, returning it with its detected format.
pub fn decode_file(path: &Path) -> Result<(DynamicImage, ImageFormat), ImageProcessingError> {
    let bytes = std::fs::read(path)?;
    let format = detect_format(&bytes).ok_or_else(|| {
        ImageProcessingError::UnsupportedFormat(format!("unrecognized image data in {}", path.display()))
    })?;
    let image = image::load_from_memory_with_format(&bytes, format)
        .map_err(ImageProcessingError::Decode)?;
    Ok((image, format))
}

/// Map the 0-9 PNG level onto the encoder's compression presets.
pub fn png_compression(level: u8) -> CompressionType {
    match level {
        0..=3 => CompressionType::Fast,
        4..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

/// Encoding parameters
#[derive(Debug, Clone, Copy)]
pub struct EncodeSettings {
    /// JPEG quality (0-100)
    pub quality: u8,
    /// PNG compression level (0-9)
    pub png_level: u8,
}

/// Encode `image` as `format` into `path`.
pub fn encode_file(
    image: &DynamicImage,
    format: ImageFormat,
    settings: EncodeSettings,
    path: &Path,
) -> Result<(), ImageProcessingError> {
    let temp_path = temp_sibling(path);
    let result = write_encoded(image, format, settings, &temp_path);
    if let Err(e) = result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Byte-copy `from` to `to` through a temporary sibling.
pub fn copy_file(from: &Path, to: &Path) -> Result<(), ImageProcessingError> {
    if from == to {
        return Ok(());
    }
    let temp_path = temp_sibling(to);
    if let Err(e) = std::fs::copy(from, &temp_path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }
    std::fs::rename(&temp_path, to)?;
    Ok(())
}

fn write_encoded(
    image: &DynamicImage,
    format: ImageFormat,
    settings: EncodeSettings,
    path: &Path,
) -> Result<(), ImageProcessingError> {
    let mut writer = BufWriter::new(File::create(path)?);
    let (width, height) = (image.width(), image.height());

    match format {
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel
            let rgb = image.to_rgb8();
            JpegEncoder::new_with_quality(&mut writer, settings.quality.clamp(1, 100))
                .write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
                .map_err(ImageProcessingError::Encode)?;
        }
        ImageFormat::Png => {
            let encoder = PngEncoder::new_with_quality(
                &mut writer,
                png_compression(settings.png_level),
                FilterType::Adaptive,
            );
            // Transparency is kept whenever the source has an alpha channel
            let written = if image.color().has_alpha() {
                let rgba = image.to_rgba8();
                encoder.write_image(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)
            } else {
                let rgb = image.to_rgb8();
                encoder.write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
            };
            written.map_err(ImageProcessingError::Encode)?;
        }
        ImageFormat::Gif => {
            let rgba = image.to_rgba8();
            GifEncoder::new(&mut writer)
                .encode(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)
                .map_err(ImageProcessingError::Encode)?;
        }
        ImageFormat::WebP => {
            let rgba = image.to_rgba8();
            WebPEncoder::new_lossless(&mut writer)
                .write_image(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)
                .map_err(ImageProcessingError::Encode)?;
        }
        other => {
            return Err(ImageProcessingError::UnsupportedFormat(format!(
                "cannot encode {:?}",
                other
            )));
        }
    }

    writer.flush()?;
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}
