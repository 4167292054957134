//! Multi-resolution image output
//!
//! Captured rasters arrive at the browser's device scale factor (2x by
//! default). The encoder derives a 1x copy and writes both as PNG and WebP
//! under a versioned directory.

use crate::{sanitize_filename, CaptureError, OutputSettings};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputPaths {
    pub primary: PathBuf,
    pub primary_2x: PathBuf,
    pub webp: PathBuf,
    pub webp_2x: PathBuf,
}

impl OutputPaths {
    pub fn alternates(&self) -> Vec<PathBuf> {
        vec![self.webp.clone(), self.webp_2x.clone()]
    }
}

/// Where the images for `name` at `version` are written
///
/// Pure: the same inputs always give the same paths, so repeated captures of
/// one name overwrite the previous files. Both `version` and `name` are
/// reduced to single path components, so the result always stays below
/// `base`.
///
/// ```rust
/// use capture_service::output_paths;
/// use std::path::Path;
///
/// let paths = output_paths(Path::new("shots"), "2", "home");
/// assert_eq!(paths.primary, Path::new("shots/v2/home.png"));
/// assert_eq!(paths.primary_2x, Path::new("shots/v2/home@2x.png"));
/// ```
pub fn output_paths(base: &Path, version: &str, name: &str) -> OutputPaths {
    let version = sanitize_filename(version.trim_start_matches(['v', 'V']));
    let name = sanitize_filename(name);
    let dir = base.join(format!("v{version}"));
    OutputPaths {
        primary: dir.join(format!("{name}.png")),
        primary_2x: dir.join(format!("{name}@2x.png")),
        webp: dir.join(format!("{name}.webp")),
        webp_2x: dir.join(format!("{name}@2x.webp")),
    }
}

/// What was written, with the 1x dimensions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodedImages {
    pub paths: OutputPaths,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct ImageEncoder {
    base_path: PathBuf,
    min_downscale_width: u32,
    scale_factor: f64,
}

impl ImageEncoder {
    /// `scale_factor` is the device pixel ratio the rasters were captured at.
    pub fn new(settings: &OutputSettings, scale_factor: f64) -> Self {
        Self {
            base_path: settings.base_path.clone(),
            min_downscale_width: settings.min_downscale_width,
            scale_factor: scale_factor.max(1.0),
        }
    }

    pub fn paths_for(&self, version: &str, name: &str) -> OutputPaths {
        output_paths(&self.base_path, version, name)
    }

    /// Decodes, resamples and writes on the blocking pool.
    pub async fn encode(&self, png_2x: Vec<u8>, version: &str, name: &str) -> Result<EncodedImages, CaptureError> {
        let paths = self.paths_for(version, name);
        let min_downscale_width = self.min_downscale_width;
        let scale_factor = self.scale_factor;

        tokio::task::spawn_blocking(move || write_all(&png_2x, paths, scale_factor, min_downscale_width))
            .await
            .map_err(|e| CaptureError::EncodingFailed(format!("encoder task failed: {e}")))?
    }
}

fn write_all(
    png_2x: &[u8],
    paths: OutputPaths,
    scale_factor: f64,
    min_downscale_width: u32,
) -> Result<EncodedImages, CaptureError> {
    let source = image::load_from_memory_with_format(png_2x, ImageFormat::Png)?;
    let standard = downscale(&source, scale_factor, min_downscale_width);

    if let Some(dir) = paths.primary.parent() {
        std::fs::create_dir_all(dir)?;
    }

    std::fs::write(&paths.primary_2x, png_2x)?;
    std::fs::write(&paths.primary, encode(&standard, ImageFormat::Png)?)?;
    std::fs::write(&paths.webp_2x, encode(&source, ImageFormat::WebP)?)?;
    std::fs::write(&paths.webp, encode(&standard, ImageFormat::WebP)?)?;

    debug!(
        path = %paths.primary.display(),
        width = standard.width(),
        height = standard.height(),
        "Wrote capture outputs"
    );

    Ok(EncodedImages {
        width: standard.width(),
        height: standard.height(),
        paths,
    })
}

/// Brings a raster captured at `scale_factor` back to 1x with Lanczos3.
///
/// The source is kept unchanged when it was already captured at 1x or is
/// narrower than `min_downscale_width`.
pub fn downscale(source: &DynamicImage, scale_factor: f64, min_downscale_width: u32) -> DynamicImage {
    if scale_factor <= 1.0 || source.width() < min_downscale_width {
        return source.clone();
    }
    let width = ((f64::from(source.width()) / scale_factor).round() as u32).max(1);
    let height = ((f64::from(source.height()) / scale_factor).round() as u32).max(1);
    source.resize_exact(width, height, FilterType::Lanczos3)
}

fn encode(img: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, CaptureError> {
    // The WebP encoder only takes 8-bit RGB(A)
    let rgba;
    let img = if format == ImageFormat::WebP {
        rgba = DynamicImage::ImageRgba8(img.to_rgba8());
        &rgba
    } else {
        img
    };

    let mut data = Vec::new();
    img.write_to(&mut Cursor::new(&mut data), format)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(width, height, |x, y| Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255]));
        encode(&DynamicImage::ImageRgba8(img), ImageFormat::Png).unwrap()
    }

    fn encoder_at(base: &Path, scale_factor: f64) -> ImageEncoder {
        ImageEncoder::new(
            &OutputSettings {
                base_path: base.to_path_buf(),
                default_version: "1".to_string(),
                min_downscale_width: 200,
            },
            scale_factor,
        )
    }

    fn encoder(base: &Path) -> ImageEncoder {
        encoder_at(base, 2.0)
    }

    #[test]
    fn test_output_paths_are_pure() {
        let a = output_paths(Path::new("out"), "3", "intro");
        let b = output_paths(Path::new("out"), "v3", "intro");
        assert_eq!(a, b);
        assert_eq!(a.webp, PathBuf::from("out/v3/intro.webp"));
        assert_eq!(a.webp_2x, PathBuf::from("out/v3/intro@2x.webp"));
        assert_eq!(a.alternates().len(), 2);
    }

    #[test]
    fn test_output_paths_stay_below_base() {
        let paths = output_paths(Path::new("out"), "../..", "../../etc/x");
        for path in [&paths.primary, &paths.primary_2x, &paths.webp, &paths.webp_2x] {
            assert!(path.starts_with("out"), "{} escaped", path.display());
            assert!(!path.components().any(|c| c == std::path::Component::ParentDir));
            assert_eq!(path.components().count(), 3);
        }
    }

    #[tokio::test]
    async fn test_encode_writes_four_files_and_halves_wide_images() {
        let dir = tempfile::tempdir().unwrap();
        let encoded = encoder(dir.path()).encode(png(400, 300), "1", "wide").await.unwrap();

        assert_eq!((encoded.width, encoded.height), (200, 150));
        for path in [
            &encoded.paths.primary,
            &encoded.paths.primary_2x,
            &encoded.paths.webp,
            &encoded.paths.webp_2x,
        ] {
            assert!(path.exists(), "{} missing", path.display());
        }

        let standard = image::open(&encoded.paths.primary).unwrap();
        assert_eq!(standard.width(), 200);
        let retina = image::open(&encoded.paths.primary_2x).unwrap();
        assert_eq!(retina.width(), 400);
    }

    #[tokio::test]
    async fn test_narrow_images_are_reused_at_1x() {
        let dir = tempfile::tempdir().unwrap();
        let encoded = encoder(dir.path()).encode(png(120, 40), "1", "narrow").await.unwrap();

        assert_eq!((encoded.width, encoded.height), (120, 40));
    }

    #[tokio::test]
    async fn test_repeated_capture_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = encoder(dir.path());

        let first = encoder.encode(png(400, 300), "1", "same").await.unwrap();
        let second = encoder.encode(png(600, 300), "1", "same").await.unwrap();

        assert_eq!(first.paths, second.paths);
        assert_eq!(image::open(&second.paths.primary).unwrap().width(), 300);
    }

    #[tokio::test]
    async fn test_1x_capture_is_not_shrunk() {
        let dir = tempfile::tempdir().unwrap();
        let encoded = encoder_at(dir.path(), 1.0).encode(png(1280, 800), "1", "flat").await.unwrap();

        assert_eq!((encoded.width, encoded.height), (1280, 800));
        assert_eq!(image::open(&encoded.paths.primary).unwrap().width(), 1280);
    }

    #[tokio::test]
    async fn test_3x_capture_is_divided_by_its_scale() {
        let dir = tempfile::tempdir().unwrap();
        let encoded = encoder_at(dir.path(), 3.0).encode(png(1200, 600), "1", "dense").await.unwrap();

        assert_eq!((encoded.width, encoded.height), (400, 200));
    }

    #[test]
    fn test_downscale_rounds_fractional_scales() {
        let source = DynamicImage::ImageRgba8(RgbaImage::new(1000, 300));
        let standard = downscale(&source, 1.5, 200);
        assert_eq!((standard.width(), standard.height()), (667, 200));
    }

    #[tokio::test]
    async fn test_invalid_png_is_encoding_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = encoder(dir.path()).encode(vec![0, 1, 2], "1", "bad").await.unwrap_err();
        assert!(matches!(err, CaptureError::EncodingFailed(_)));
    }
}
