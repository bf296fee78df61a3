//! Image compression: bound the longest edge, then re-encode as JPEG until
//! the output fits the byte target.
//!
//! Decoding and encoding are CPU-bound and run on the blocking pool so the
//! event loop keeps serving realtime events and view intents meanwhile.

use crate::config::UploadConfig;
use crate::model::{MAX_EDGE_PIXELS, TARGET_BYTES};
use async_trait::async_trait;
use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageReader};
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

/// JPEG qualities tried in order at each size
const QUALITY_STEPS: [u8; 6] = [85, 75, 65, 55, 45, 35];

/// How many times the image is shrunk when no quality reaches the target
const MAX_DOWNSCALE_ROUNDS: u32 = 3;

/// Scale applied per downscale round
const DOWNSCALE_FACTOR: f64 = 0.75;

const JPEG_MIME: &str = "image/jpeg";

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("image decode error: {0}")]
    Decode(String),

    #[error("image encode error: {0}")]
    Encode(String),

    #[error("compression worker failed: {0}")]
    Worker(String),
}

/// Compression targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressOptions {
    /// Desired encoded size in bytes
    pub target_bytes: usize,
    /// Longest edge of the output in pixels
    pub max_edge_pixels: u32,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            target_bytes: TARGET_BYTES,
            max_edge_pixels: MAX_EDGE_PIXELS,
        }
    }
}

impl From<&UploadConfig> for CompressOptions {
    fn from(config: &UploadConfig) -> Self {
        Self {
            target_bytes: config.target_bytes,
            max_edge_pixels: config.max_edge_pixels,
        }
    }
}

/// Compressed output with its declared content type
#[derive(Debug, Clone)]
pub struct CompressedImage {
    pub bytes: Bytes,
    pub content_type: String,
    pub width: u32,
    pub height: u32,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Compressor: Send + Sync {
    /// Compress `bytes` towards `options`. Undecodable input is a
    /// [`CompressionError::Decode`].
    async fn compress(
        &self,
        bytes: Bytes,
        options: CompressOptions,
    ) -> Result<CompressedImage, CompressionError>;
}

/// Compressor backed by the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCompressor;

#[async_trait]
impl Compressor for ImageCompressor {
    async fn compress(
        &self,
        bytes: Bytes,
        options: CompressOptions,
    ) -> Result<CompressedImage, CompressionError> {
        tokio::task::spawn_blocking(move || compress_image(&bytes, options))
            .await
            .map_err(|e| CompressionError::Worker(e.to_string()))?
    }
}

/// Synchronous compression core.
///
/// Input already within both limits is returned untouched. Otherwise the
/// image is resized to fit `max_edge_pixels` and encoded at falling JPEG
/// qualities, shrinking further between rounds; if nothing reaches the
/// target the smallest encoding wins.
pub fn compress_image(
    data: &[u8],
    options: CompressOptions,
) -> Result<CompressedImage, CompressionError> {
    let format = image::guess_format(data).ok();
    let img = decode_upright(data)?;

    let (width, height) = (img.width(), img.height());
    let max_edge = options.max_edge_pixels.max(1);

    if width.max(height) <= max_edge && data.len() <= options.target_bytes {
        if let Some(format) = format {
            debug!(width, height, size_bytes = data.len(), "Image already within limits");
            return Ok(CompressedImage {
                bytes: Bytes::copy_from_slice(data),
                content_type: format.to_mime_type().to_string(),
                width,
                height,
            });
        }
    }

    let mut current = if width.max(height) > max_edge {
        img.resize(max_edge, max_edge, FilterType::Lanczos3)
    } else {
        img
    };

    let mut best: Option<(Vec<u8>, u32, u32)> = None;

    for round in 0..=MAX_DOWNSCALE_ROUNDS {
        for quality in QUALITY_STEPS {
            let encoded = encode_jpeg(&current, quality)?;
            let fits = encoded.len() <= options.target_bytes;

            if best.as_ref().map_or(true, |(b, _, _)| encoded.len() < b.len()) {
                best = Some((encoded, current.width(), current.height()));
            }

            if fits {
                debug!(round, quality, "Compression target reached");
                break;
            }
        }

        if best
            .as_ref()
            .is_some_and(|(b, _, _)| b.len() <= options.target_bytes)
        {
            break;
        }

        let (next_width, next_height) = downscale(current.width(), current.height());
        if (next_width, next_height) == (current.width(), current.height()) {
            break;
        }
        current = current.resize_exact(next_width, next_height, FilterType::Triangle);
    }

    let (bytes, out_width, out_height) =
        best.ok_or_else(|| CompressionError::Encode("no encoding produced".to_string()))?;

    debug!(
        original_bytes = data.len(),
        compressed_bytes = bytes.len(),
        width = out_width,
        height = out_height,
        "Image compressed"
    );

    Ok(CompressedImage {
        bytes: Bytes::from(bytes),
        content_type: JPEG_MIME.to_string(),
        width: out_width,
        height: out_height,
    })
}

/// Decode and apply the EXIF orientation, so width and height are the
/// displayed ones and the re-encoded JPEG needs no orientation tag.
fn decode_upright(data: &[u8]) -> Result<DynamicImage, CompressionError> {
    let decode_err = |e: image::ImageError| CompressionError::Decode(e.to_string());

    let mut decoder = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| CompressionError::Decode(e.to_string()))?
        .into_decoder()
        .map_err(decode_err)?;
    let orientation = decoder.orientation().map_err(decode_err)?;

    let mut img = DynamicImage::from_decoder(decoder).map_err(decode_err)?;
    img.apply_orientation(orientation);
    Ok(img)
}

fn downscale(width: u32, height: u32) -> (u32, u32) {
    let scale = |v: u32| ((v as f64 * DOWNSCALE_FACTOR).round() as u32).max(1);
    (scale(width), scale(height))
}

/// Encode as baseline JPEG; alpha is dropped.
fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, CompressionError> {
    let rgb = img.to_rgb8();
    let mut output = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, quality);
    encoder
        .encode_image(&rgb)
        .map_err(|e| CompressionError::Encode(e.to_string()))?;
    Ok(output)
}
