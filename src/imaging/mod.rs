//! Image derivative pipeline
//!
//! Produces the derivatives of an uploaded image and performs pixel crops:
//! - `main`: the stored file, re-encoded at the configured quality or copied verbatim
//! - `original`: an untouched `<stem>_original.<ext>` copy (optional)
//! - `webp`: a `<stem>.webp` sibling (optional)
//!
//! When an original is kept, every other derivative is generated from that copy,
//! so re-encoding never compounds on an already-compressed file.

pub mod codec;

use std::path::{Path, PathBuf};

use image::{GenericImageView, ImageFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ImageProcessingConfig;
use crate::naming::{split_name, with_suffix};
use codec::{EncodeSettings, copy_file, decode_file, detect_format, encode_file};

/// JPEG/WebP quality used when writing cropped images
pub const CROP_QUALITY: u8 = 90;

/// Errors raised by image processing
#[derive(Debug, Error)]
pub enum ImageProcessingError {
    /// The file is not an image format the pipeline handles
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// The image data could not be decoded
    #[error("Failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    /// The image could not be encoded
    #[error("Failed to encode image: {0}")]
    Encode(#[source] image::ImageError),

    /// Crop rectangle is empty or reaches outside the source
    #[error("Invalid crop dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-upload processing options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageOptions {
    /// Re-encode the main file
    pub compression_enabled: bool,
    /// JPEG quality (0-100)
    pub compression_quality: u8,
    /// PNG compression level (0-9)
    pub png_compression_level: u8,
    /// Generate a `.webp` sibling
    pub create_webp: bool,
    /// Keep an untouched copy of the input
    pub keep_original: bool,
}

impl Default for ImageOptions {
    fn default() -> Self {
        ImageProcessingConfig::default().options()
    }
}

impl ImageOptions {
    /// Options that store the file verbatim with no derivatives
    pub fn passthrough() -> Self {
        Self {
            compression_enabled: false,
            create_webp: false,
            keep_original: false,
            ..Self::default()
        }
    }

    fn encode_settings(&self) -> EncodeSettings {
        EncodeSettings {
            quality: self.compression_quality,
            png_level: self.png_compression_level,
        }
    }
}

/// Role of a produced file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivativeRole {
    Main,
    Original,
    Webp,
}

/// Files produced by [`ImageDerivativePipeline::process`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDerivativeSet {
    /// The stored file (always present)
    pub main: PathBuf,
    /// Untouched copy of the input
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original: Option<PathBuf>,
    /// WebP conversion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webp: Option<PathBuf>,
}

impl ImageDerivativeSet {
    fn main_only(main: &Path) -> Self {
        Self {
            main: main.to_path_buf(),
            original: None,
            webp: None,
        }
    }

    /// Path for `role`, if it was produced
    pub fn get(&self, role: DerivativeRole) -> Option<&Path> {
        match role {
            DerivativeRole::Main => Some(&self.main),
            DerivativeRole::Original => self.original.as_deref(),
            DerivativeRole::Webp => self.webp.as_deref(),
        }
    }

    /// All produced files with their roles, `main` first
    pub fn iter(&self) -> impl Iterator<Item = (DerivativeRole, &Path)> {
        [
            DerivativeRole::Main,
            DerivativeRole::Original,
            DerivativeRole::Webp,
        ]
        .into_iter()
        .filter_map(move |role| self.get(role).map(|path| (role, path)))
    }

    /// Number of produced files
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Always false: `main` is always present
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Formats `process` re-encodes. Anything else is stored as-is.
fn is_processable(format: ImageFormat) -> bool {
    matches!(format, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Gif)
}

/// Formats `crop` accepts.
fn is_croppable(format: ImageFormat) -> bool {
    is_processable(format) || format == ImageFormat::WebP
}

/// Generates image derivatives and crops.
#[derive(Debug, Clone)]
pub struct ImageDerivativePipeline {
    png_compression_level: u8,
}

impl Default for ImageDerivativePipeline {
    fn default() -> Self {
        Self::new(&ImageProcessingConfig::default())
    }
}

impl ImageDerivativePipeline {
    /// Create a pipeline using the configured PNG level for crops
    pub fn new(config: &ImageProcessingConfig) -> Self {
        Self {
            png_compression_level: config.png_compression_level,
        }
    }

    /// Crop the rectangle `(x, y, width, height)` of `source` into `output`.
    ///
    /// The output is exactly `width x height` and uses the source's format.
    /// Returns `false` when the format is unsupported, decoding fails or the
    /// rectangle reaches outside the source.
    /// `output` must differ from `source`.
    pub fn crop(&self, source: &Path, x: u32, y: u32, width: u32, height: u32, output: &Path) -> bool {
        match self.try_crop(source, x, y, width, height, output) {
            Ok(()) => true,
            Err(e) => {
                warn!("Crop of {} failed: {}", source.display(), e);
                false
            }
        }
    }

    /// Fallible form of [`crop`](Self::crop).
    pub fn try_crop(
        &self,
        source: &Path,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        output: &Path,
    ) -> Result<(), ImageProcessingError> {
        if width == 0 || height == 0 {
            return Err(ImageProcessingError::InvalidDimensions { width, height });
        }
        if source == output {
            return Err(ImageProcessingError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "crop output must differ from its source",
            )));
        }

        let (image, format) = decode_file(source)?;
        if !is_croppable(format) {
            return Err(ImageProcessingError::UnsupportedFormat(format!("{:?}", format)));
        }

        // The rectangle must lie inside the source
        let (source_width, source_height) = image.dimensions();
        let fits = |start: u32, length: u32, limit: u32| {
            start.checked_add(length).is_some_and(|end| end <= limit)
        };
        if !fits(x, width, source_width) || !fits(y, height, source_height) {
            return Err(ImageProcessingError::InvalidDimensions { width, height });
        }

        let region = image.crop_imm(x, y, width, height);

        encode_file(
            &region,
            format,
            EncodeSettings {
                quality: CROP_QUALITY,
                png_level: self.png_compression_level,
            },
            output,
        )?;

        debug!(
            "Cropped {} ({}x{} at {},{}) into {}",
            source.display(),
            width,
            height,
            x,
            y,
            output.display()
        );
        Ok(())
    }

    /// Produce the derivatives of `input`, storing the main file at `output`.
    ///
    /// Only JPEG, PNG and GIF inputs are processed; other files are stored as-is.
    /// An `original` or `webp` sibling is skipped when a file already occupies
    /// its path, so existing files are never overwritten.
    pub fn process(
        &self,
        input: &Path,
        output: &Path,
        options: &ImageOptions,
    ) -> Result<ImageDerivativeSet, ImageProcessingError> {
        let bytes = std::fs::read(input)?;
        let format = match detect_format(&bytes) {
            Some(format) if is_processable(format) => format,
            _ => {
                copy_file(input, output)?;
                return Ok(ImageDerivativeSet::main_only(output));
            }
        };

        let mut result = ImageDerivativeSet::main_only(output);
        let mut source = input.to_path_buf();

        if options.keep_original {
            let original = sibling_with_suffix(output, "original");
            if is_occupied(&original, input, output) {
                warn!("Skipping original copy, {} already exists", original.display());
            } else {
                copy_file(input, &original)?;
                source = original.clone();
                result.original = Some(original);
            }
        }

        let decoded = if options.compression_enabled || options.create_webp {
            Some(
                image::load_from_memory_with_format(&bytes, format)
                    .map_err(ImageProcessingError::Decode)?,
            )
        } else {
            None
        };

        match (&decoded, options.compression_enabled) {
            (Some(image), true) => encode_file(image, format, options.encode_settings(), output)?,
            _ => copy_file(&source, output)?,
        }

        if options.create_webp
            && let Some(image) = &decoded
        {
            let webp = sibling_with_extension(output, "webp");
            if is_occupied(&webp, input, output) {
                warn!("Skipping WebP derivative, {} already exists", webp.display());
            } else {
                match encode_file(image, ImageFormat::WebP, options.encode_settings(), &webp) {
                    Ok(()) => result.webp = Some(webp),
                    Err(e) => warn!("WebP derivative for {} failed: {}", output.display(), e),
                }
            }
        }

        debug!(
            "Processed {} into {} file(s)",
            input.display(),
            result.len()
        );
        Ok(result)
    }
}

/// True when `path` names an existing entry other than the files being processed
fn is_occupied(path: &Path, input: &Path, output: &Path) -> bool {
    path != input && path != output && path.symlink_metadata().is_ok()
}

/// `<dir>/<stem>_<suffix>.<ext>` next to `path`
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(with_suffix(&name, suffix))
}

/// `<dir>/<stem>.<extension>` next to `path`
pub fn sibling_with_extension(path: &Path, extension: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, _) = split_name(&name);
    path.with_file_name(format!("{}.{}", stem, extension))
}

/// Pixel dimensions of an image file
pub fn dimensions(path: &Path) -> Result<(u32, u32), ImageProcessingError> {
    let (image, _) = decode_file(path)?;
    Ok(image.dimensions())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage};
    use tempfile::TempDir;

    fn write_jpeg(path: &Path, width: u32, height: u32) {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x * 2) as u8, (y * 2) as u8, 128]));
        DynamicImage::ImageRgb8(img)
            .save_with_format(path, ImageFormat::Jpeg)
            .unwrap();
    }

    #[test]
    fn test_sibling_paths() {
        let path = Path::new("/up/photos/cat.jpg");
        assert_eq!(
            sibling_with_suffix(path, "original"),
            PathBuf::from("/up/photos/cat_original.jpg")
        );
        assert_eq!(
            sibling_with_extension(path, "webp"),
            PathBuf::from("/up/photos/cat.webp")
        );
    }

    #[test]
    fn test_crop_produces_exact_dimensions() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("photo.jpg");
        let output = temp.path().join("photo_cropped.jpg");
        write_jpeg(&source, 100, 100);

        let pipeline = ImageDerivativePipeline::default();
        assert!(pipeline.crop(&source, 10, 10, 50, 50, &output));
        assert_eq!(dimensions(&output).unwrap(), (50, 50));
        assert_eq!(dimensions(&source).unwrap(), (100, 100));
    }

    #[test]
    fn test_crop_rejects_unsupported_and_same_path() {
        let temp = TempDir::new().unwrap();
        let text = temp.path().join("doc.txt");
        std::fs::write(&text, b"not an image").unwrap();

        let pipeline = ImageDerivativePipeline::default();
        assert!(!pipeline.crop(&text, 0, 0, 10, 10, &temp.path().join("out.txt")));

        let source = temp.path().join("photo.jpg");
        write_jpeg(&source, 20, 20);
        assert!(!pipeline.crop(&source, 0, 0, 10, 10, &source));
        assert!(!pipeline.crop(&source, 0, 0, 0, 10, &temp.path().join("z.jpg")));
    }

    #[test]
    fn test_crop_rejects_rectangles_outside_source() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("photo.jpg");
        let output = temp.path().join("photo_cropped.jpg");
        write_jpeg(&source, 40, 30);

        let pipeline = ImageDerivativePipeline::default();
        for (x, y, width, height) in [
            (0, 0, u32::MAX, u32::MAX),
            (u32::MAX, 0, 1, 1),
            (30, 0, 20, 10),
            (0, 25, 10, 10),
            (0, 0, 41, 30),
        ] {
            let result = pipeline.try_crop(&source, x, y, width, height, &output);
            assert!(
                matches!(result, Err(ImageProcessingError::InvalidDimensions { .. })),
                "({}, {}, {}, {}) accepted",
                x,
                y,
                width,
                height
            );
        }
        assert!(!output.exists());

        assert!(pipeline.crop(&source, 0, 0, 40, 30, &output));
        assert_eq!(dimensions(&output).unwrap(), (40, 30));
    }

    #[test]
    fn test_process_keeps_existing_siblings() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cat.jpg");
        let webp = temp.path().join("cat.webp");
        let original = temp.path().join("cat_original.jpg");
        write_jpeg(&path, 16, 16);
        std::fs::write(&webp, b"someone else's webp").unwrap();
        std::fs::write(&original, b"someone else's original").unwrap();

        let set = ImageDerivativePipeline::default()
            .process(&path, &path, &ImageOptions::default())
            .unwrap();

        assert_eq!(set, ImageDerivativeSet::main_only(&path));
        assert_eq!(std::fs::read(&webp).unwrap(), b"someone else's webp");
        assert_eq!(std::fs::read(&original).unwrap(), b"someone else's original");
        assert_eq!(dimensions(&path).unwrap(), (16, 16));
    }

    #[test]
    fn test_process_all_derivatives() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cat.jpg");
        write_jpeg(&path, 32, 24);

        let pipeline = ImageDerivativePipeline::default();
        let set = pipeline
            .process(&path, &path, &ImageOptions::default())
            .unwrap();

        assert_eq!(set.main, path);
        assert_eq!(set.original, Some(temp.path().join("cat_original.jpg")));
        assert_eq!(set.webp, Some(temp.path().join("cat.webp")));
        assert_eq!(set.len(), 3);
        for (_, file) in set.iter() {
            assert!(file.exists(), "{} missing", file.display());
        }
        assert_eq!(dimensions(&temp.path().join("cat.webp")).unwrap(), (32, 24));
    }

    #[test]
    fn test_process_without_compression_copies_verbatim() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("in.jpg");
        let output = temp.path().join("out.jpg");
        write_jpeg(&input, 8, 8);

        let options = ImageOptions {
            compression_enabled: false,
            create_webp: false,
            keep_original: false,
            ..ImageOptions::default()
        };
        let set = ImageDerivativePipeline::default()
            .process(&input, &output, &options)
            .unwrap();

        assert_eq!(set.len(), 1);
        assert_eq!(std::fs::read(&input).unwrap(), std::fs::read(&output).unwrap());
    }

    #[test]
    fn test_process_skips_non_processable_formats() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("notes.txt");
        std::fs::write(&path, b"plain text").unwrap();

        let set = ImageDerivativePipeline::default()
            .process(&path, &path, &ImageOptions::default())
            .unwrap();
        assert_eq!(set, ImageDerivativeSet::main_only(&path));
        assert_eq!(std::fs::read(&path).unwrap(), b"plain text");
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }
}
