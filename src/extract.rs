//! Feature extraction: image bytes → (fingerprint, fields).
//!
//! Decoding, hashing and preprocessing are CPU-bound and run on the blocking
//! pool. Recognition runs on the configured [`TextRecognizer`].
//!
//! Only PNG and JPEG are accepted. The format is sniffed from the bytes, not
//! taken from the client's declared content type, so a text file renamed to
//! `.png` fails here with [`ExtractError::UnsupportedFormat`].
//!
//! Pixel work is bounded twice. The decoder refuses images whose sides
//! exceed `max_image_side` before allocating ([`ExtractError::ImageTooLarge`]),
//! and the recognizer input is downscaled to `working_side` before blur and
//! binarization. A blocking task cannot be cancelled, so dropping the
//! extraction future raises a flag the task checks between stages.
//!
//! Recognition problems never fail extraction. A recognizer error is logged
//! and treated as "no text", and text whose confidence is too low is
//! dropped entirely rather than partially trusted.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageError, ImageFormat, ImageReader, Limits, Luma};

use docsift_core::error::ExtractError;
use docsift_core::fields::parse_fields;
use docsift_core::fingerprint::{Fingerprint, HASH_INPUT_SIDE};
use docsift_core::models::{ExtractedFields, TextRegion};

use crate::config::ExtractionConfig;
use crate::ocr::TextRecognizer;

/// Blur applied before Otsu binarization (about a 5×5 Gaussian kernel).
const PREPROCESS_BLUR_SIGMA: f32 = 1.1;

/// Decoder allocation budget per pixel of the largest accepted image.
const DECODE_BYTES_PER_PIXEL: u64 = 4;

#[derive(Debug, Clone, Copy)]
struct ImageSettings {
    max_side: u32,
    working_side: u32,
    binarize: bool,
}

struct Analysis {
    fingerprint: Fingerprint,
    recognizer_input: Option<Vec<u8>>,
}

/// Raises the flag when the awaiting future goes away.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub struct FeatureExtractor {
    recognizer: Arc<dyn TextRecognizer>,
    image: ImageSettings,
    min_region_confidence: f32,
    min_mean_confidence: f32,
}

impl FeatureExtractor {
    pub fn new(config: &ExtractionConfig, recognizer: Arc<dyn TextRecognizer>) -> Self {
        Self {
            recognizer,
            image: ImageSettings {
                max_side: config.max_image_side,
                working_side: config.working_side,
                binarize: config.binarize,
            },
            min_region_confidence: config.min_region_confidence,
            min_mean_confidence: config.min_mean_confidence,
        }
    }

    pub fn recognizer_name(&self) -> &str {
        self.recognizer.name()
    }

    /// Extract the perceptual fingerprint and structured fields.
    ///
    /// Deterministic in the fingerprint: the same bytes always hash to the
    /// same value regardless of what the recognizer returns.
    pub async fn extract(
        &self,
        bytes: &[u8],
    ) -> Result<(Fingerprint, ExtractedFields), ExtractError> {
        let owned = bytes.to_vec();
        let settings = self.image;
        let abandoned = Arc::new(AtomicBool::new(false));
        let _abandon = AbandonOnDrop(Arc::clone(&abandoned));

        let analysis = tokio::task::spawn_blocking(move || analyze(&owned, settings, &abandoned))
            .await
            .map_err(|e| ExtractError::Internal(format!("image analysis task failed: {}", e)))??
            .ok_or_else(|| ExtractError::Internal("image analysis abandoned".to_string()))?;

        let Some(png) = analysis.recognizer_input else {
            return Ok((analysis.fingerprint, ExtractedFields::empty()));
        };

        let regions = match self.recognizer.recognize(&png).await {
            Ok(regions) => regions,
            Err(e) => {
                tracing::warn!(
                    recognizer = self.recognizer.name(),
                    error = %e,
                    "text recognition failed; continuing without fields"
                );
                Vec::new()
            }
        };

        Ok((analysis.fingerprint, self.fields_from_regions(regions)))
    }

    /// Apply the confidence gates and run the field parsers.
    pub fn fields_from_regions(&self, regions: Vec<TextRegion>) -> ExtractedFields {
        let kept: Vec<TextRegion> = regions
            .into_iter()
            .filter(|r| r.confidence >= self.min_region_confidence && !r.text.trim().is_empty())
            .collect();

        if kept.is_empty() {
            return ExtractedFields::empty();
        }
        let mean = kept.iter().map(|r| r.confidence).sum::<f32>() / kept.len() as f32;
        if mean < self.min_mean_confidence {
            tracing::debug!(mean, regions = kept.len(), "recognized text below confidence floor");
            return ExtractedFields::empty();
        }

        ExtractedFields {
            values: parse_fields(&kept),
            regions: kept,
        }
    }
}

/// Blocking half of extraction. `None` means the caller went away and the
/// remaining stages were skipped.
fn analyze(
    bytes: &[u8],
    settings: ImageSettings,
    abandoned: &AtomicBool,
) -> Result<Option<Analysis>, ExtractError> {
    let gray = decode_gray(bytes, settings.max_side)?;
    let fingerprint = fingerprint_image(&gray);
    if abandoned.load(Ordering::Relaxed) {
        tracing::debug!("extraction abandoned after fingerprinting");
        return Ok(None);
    }

    let working = bound_side(gray, settings.working_side);
    if abandoned.load(Ordering::Relaxed) {
        tracing::debug!("extraction abandoned before preprocessing");
        return Ok(None);
    }

    let recognizer_input = match encode_png(preprocess(&working, settings.binarize)) {
        Ok(png) => Some(png),
        Err(e) => {
            tracing::warn!(error = %e, "could not encode recognizer input");
            None
        }
    };
    Ok(Some(Analysis {
        fingerprint,
        recognizer_input,
    }))
}

/// Sniff and decode a PNG or JPEG into 8-bit luminance, refusing images
/// with a side longer than `max_side`.
pub fn decode_gray(bytes: &[u8], max_side: u32) -> Result<GrayImage, ExtractError> {
    let format = image::guess_format(bytes)
        .map_err(|_| ExtractError::UnsupportedFormat("unrecognized image data".to_string()))?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
        return Err(ExtractError::UnsupportedFormat(format!(
            "{:?} images are not accepted",
            format
        )));
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(max_side);
    limits.max_image_height = Some(max_side);
    limits.max_alloc = Some(u64::from(max_side) * u64::from(max_side) * DECODE_BYTES_PER_PIXEL);

    let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
    reader.limits(limits);
    let image = reader.decode().map_err(|e| match e {
        ImageError::Limits(limit) => ExtractError::ImageTooLarge(format!(
            "{:?} image exceeds {}px per side: {}",
            format, max_side, limit
        )),
        other => ExtractError::UnsupportedFormat(format!(
            "cannot decode {:?} image: {}",
            format, other
        )),
    })?;
    Ok(image.to_luma8())
}

/// Downscale so the longest side is at most `side`, keeping aspect ratio.
pub fn bound_side(gray: GrayImage, side: u32) -> GrayImage {
    let longest = gray.width().max(gray.height());
    if longest <= side {
        return gray;
    }
    let scale = f64::from(side) / f64::from(longest);
    let width = ((f64::from(gray.width()) * scale).round() as u32).max(1);
    let height = ((f64::from(gray.height()) * scale).round() as u32).max(1);
    imageops::resize(&gray, width, height, FilterType::Triangle)
}

/// 64-bit DCT hash of a decoded image.
pub fn fingerprint_image(gray: &GrayImage) -> Fingerprint {
    let side = HASH_INPUT_SIDE as u32;
    let small = imageops::resize(gray, side, side, FilterType::Triangle);
    let grid: Vec<f64> = small.pixels().map(|p| f64::from(p.0[0])).collect();
    Fingerprint::from_luma_grid(&grid)
}

/// Fingerprint raw bytes without running recognition.
pub fn fingerprint_bytes(bytes: &[u8], max_side: u32) -> Result<Fingerprint, ExtractError> {
    decode_gray(bytes, max_side).map(|gray| fingerprint_image(&gray))
}

/// Prepare an image for recognition: blur, then (optionally) Otsu
/// binarization to dark text on a white background.
pub fn preprocess(gray: &GrayImage, binarize: bool) -> GrayImage {
    let blurred = imageops::blur(gray, PREPROCESS_BLUR_SIGMA);
    if !binarize {
        return blurred;
    }
    let threshold = otsu_threshold(&blurred);
    GrayImage::from_fn(blurred.width(), blurred.height(), |x, y| {
        if blurred.get_pixel(x, y).0[0] > threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Threshold that maximizes between-class variance of the histogram.
pub fn otsu_threshold(gray: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for p in gray.pixels() {
        histogram[p.0[0] as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 127;
    }

    let weighted_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(level, &count)| level as f64 * count as f64)
        .sum();

    let mut background_weight = 0u64;
    let mut background_sum = 0.0;
    let mut best = (0u8, f64::MIN);

    for (level, &count) in histogram.iter().enumerate() {
        background_weight += count;
        if background_weight == 0 {
            continue;
        }
        let foreground_weight = total - background_weight;
        if foreground_weight == 0 {
            break;
        }
        background_sum += level as f64 * count as f64;

        let mean_bg = background_sum / background_weight as f64;
        let mean_fg = (weighted_total - background_sum) / foreground_weight as f64;
        let variance =
            background_weight as f64 * foreground_weight as f64 * (mean_bg - mean_fg).powi(2);
        if variance > best.1 {
            best = (level as u8, variance);
        }
    }
    best.0
}

fn encode_png(gray: GrayImage) -> Result<Vec<u8>, image::ImageError> {
    let mut out = Vec::new();
    DynamicImage::ImageLuma8(gray).write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}
