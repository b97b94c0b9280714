//! Parallel resize engine.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use stowage_shared::{Dimension, VersionSpec, VersionSpecs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::VersionError;

/// Width assumed for images reporting no size; the height falls back to the width.
pub const FALLBACK_WIDTH: u32 = 50;

/// Pixel size of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Create dimensions.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Replaces zero sides: width by [`FALLBACK_WIDTH`], height by the width.
    #[must_use]
    pub const fn or_fallback(self) -> Self {
        let width = if self.width == 0 {
            FALLBACK_WIDTH
        } else {
            self.width
        };
        let height = if self.height == 0 { width } else { self.height };
        Self { width, height }
    }
}

/// A resized, re-encoded version.
#[derive(Debug, Clone)]
pub struct RenderedVersion {
    /// Encoded image in the original's format.
    pub buffer: Bytes,
    /// Size of the version.
    pub dimensions: Dimensions,
}

/// Outcome of [`generate_versions`]: one terminal entry per spec.
#[derive(Debug, Default)]
pub struct VersionBatch {
    /// Dimensions of the original used to resolve `auto` sides.
    pub source: Option<Dimensions>,
    /// Per-label results; these are authoritative.
    pub versions: BTreeMap<String, Result<RenderedVersion, VersionError>>,
    first_failed: Option<String>,
}

impl VersionBatch {
    /// The first failure in completion order, if any.
    #[must_use]
    pub fn first_error(&self) -> Option<&VersionError> {
        self.first_failed
            .as_ref()
            .and_then(|label| self.versions.get(label))
            .and_then(|result| result.as_ref().err())
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// True when no spec was given.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    fn record(&mut self, label: String, result: Result<RenderedVersion, VersionError>) {
        if let Err(err) = &result {
            warn!(version = %label, error = %err, "Version generation failed");
            if self.first_failed.is_none() {
                self.first_failed = Some(label.clone());
            }
        }
        self.versions.insert(label, result);
    }

    fn failed_all(specs: &VersionSpecs, error: &VersionError, source: Option<Dimensions>) -> Self {
        let mut batch = Self {
            source,
            ..Self::default()
        };
        for label in specs.keys() {
            batch.record(label.clone(), Err(error.clone()));
        }
        batch
    }
}

/// Resolves a spec against the original's size.
///
/// An `auto` side keeps the aspect ratio: `width = round(height * ow / oh)`
/// and symmetrically for height.
///
/// # Errors
///
/// Returns [`VersionError::InvalidSpec`] when both sides are `auto` or a side is zero.
pub fn resolve_dimensions(spec: &VersionSpec, source: Dimensions) -> Result<Dimensions, VersionError> {
    if !spec.is_valid() {
        return Err(VersionError::invalid_spec(format!(
            "width {} and height {} do not describe a size",
            spec.width, spec.height
        )));
    }
    let source = source.or_fallback();
    let resolved = match (spec.width, spec.height) {
        (Dimension::Pixels(width), Dimension::Pixels(height)) => Dimensions::new(width, height),
        (Dimension::Auto, Dimension::Pixels(height)) => {
            Dimensions::new(scale(height, source.width, source.height), height)
        }
        (Dimension::Pixels(width), Dimension::Auto) => {
            Dimensions::new(width, scale(width, source.height, source.width))
        }
        (Dimension::Auto, Dimension::Auto) => {
            return Err(VersionError::invalid_spec("both dimensions are auto"));
        }
    };
    Ok(resolved)
}

/// `round(value * numerator / denominator)`, at least 1. `denominator` is non-zero.
fn scale(value: u32, numerator: u32, denominator: u32) -> u32 {
    let denominator = u64::from(denominator);
    let scaled = (u64::from(value) * u64::from(numerator) + denominator / 2) / denominator;
    u32::try_from(scaled).unwrap_or(u32::MAX).max(1)
}

fn image_format(content_type: &str) -> Option<ImageFormat> {
    match content_type.to_ascii_lowercase().as_str() {
        "image/jpg" | "image/pjpeg" => Some(ImageFormat::Jpeg),
        other => ImageFormat::from_mime_type(other),
    }
}

fn render(
    image: &DynamicImage,
    target: Dimensions,
    format: ImageFormat,
) -> Result<RenderedVersion, VersionError> {
    let resized = image.resize_exact(target.width, target.height, FilterType::Nearest);
    // JPEG has no alpha channel.
    let resized = if format == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(resized.to_rgb8())
    } else {
        resized
    };

    let mut buffer = Cursor::new(Vec::new());
    resized
        .write_to(&mut buffer, format)
        .map_err(|e| VersionError::Encode(e.to_string()))?;

    Ok(RenderedVersion {
        buffer: Bytes::from(buffer.into_inner()),
        dimensions: target,
    })
}

/// Produces one entry per spec from `original`.
///
/// Versions are encoded like `content_type`; when that names no image
/// format, the format is sniffed from the bytes.
/// `dimensions` overrides the decoded size when known and non-zero. Versions
/// run concurrently on the blocking pool and the call returns once all of
/// them settled. Cancelling `token` fails versions that have not started.
pub async fn generate_versions(
    original: Bytes,
    content_type: &str,
    dimensions: Option<Dimensions>,
    specs: &VersionSpecs,
    token: &CancellationToken,
) -> VersionBatch {
    if specs.is_empty() {
        return VersionBatch::default();
    }
    let Some(format) =
        image_format(content_type).or_else(|| image::guess_format(&original).ok())
    else {
        let err = VersionError::UnsupportedFormat(content_type.to_string());
        return VersionBatch::failed_all(specs, &err, dimensions);
    };
    if token.is_cancelled() {
        return VersionBatch::failed_all(specs, &VersionError::Cancelled, dimensions);
    }

    let decoded =
        tokio::task::spawn_blocking(move || image::load_from_memory_with_format(&original, format))
            .await;
    let image = match decoded {
        Ok(Ok(image)) => Arc::new(image),
        Ok(Err(e)) => {
            return VersionBatch::failed_all(specs, &VersionError::Decode(e.to_string()), dimensions);
        }
        Err(e) => {
            return VersionBatch::failed_all(specs, &VersionError::Task(e.to_string()), dimensions);
        }
    };

    let (width, height) = GenericImageView::dimensions(image.as_ref());
    let source = dimensions
        .filter(|d| d.width > 0 && d.height > 0)
        .unwrap_or(Dimensions::new(width, height))
        .or_fallback();

    let mut batch = VersionBatch {
        source: Some(source),
        ..VersionBatch::default()
    };
    let mut pending = FuturesUnordered::new();

    for (label, spec) in specs {
        let target = match resolve_dimensions(spec, source) {
            Ok(target) => target,
            Err(err) => {
                batch.record(label.clone(), Err(err));
                continue;
            }
        };
        if token.is_cancelled() {
            batch.record(label.clone(), Err(VersionError::Cancelled));
            continue;
        }

        let image = Arc::clone(&image);
        let label = label.clone();
        let token = token.clone();
        pending.push(async move {
            let result = tokio::task::spawn_blocking(move || {
                if token.is_cancelled() {
                    return Err(VersionError::Cancelled);
                }
                render(&image, target, format)
            })
            .await
            .unwrap_or_else(|e| Err(VersionError::Task(e.to_string())));
            (label, result)
        });
    }

    while let Some((label, result)) = pending.next().await {
        if let Ok(version) = &result {
            debug!(
                version = %label,
                width = version.dimensions.width,
                height = version.dimensions.height,
                bytes = version.buffer.len(),
                "Version rendered"
            );
        }
        batch.record(label, result);
    }

    batch
}
