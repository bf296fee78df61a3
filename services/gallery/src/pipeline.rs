//! Per-file upload: validate, compress, store the object, record the row.
//!
//! [`UploadPipeline::upload_one`] never fails outward; it reports the outcome
//! as a bool and describes its progress as a finite sequence of
//! [`UploadStatus`] events, delivered both to a per-call observer and to a
//! watch channel the view can follow.

use crate::compressor::{CompressOptions, Compressor};
use crate::config::UploadConfig;
use crate::gateway::{StorageError, StorageGateway};
use crate::model::{NewPhoto, Photo, GROSS_SIZE_FACTOR, MAX_FINAL_BYTES};
use bytes::Bytes;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const MEBIBYTE: usize = 1024 * 1024;

/// Fallback extension for files without one
const DEFAULT_EXTENSION: &str = "jpg";

/// A file chosen by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickedFile {
    /// Original file name, extension included
    pub name: String,
    /// Declared MIME type
    pub content_type: String,
    pub bytes: Bytes,
}

impl PickedFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Bytes) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// Read a file from disk, declaring its type from the extension
    pub async fn read(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok(Self::new(name, content_type, Bytes::from(bytes)))
    }

    /// Whether the declared type is an image
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }

    /// Text after the last dot of the name, if any
    pub fn extension(&self) -> Option<&str> {
        self.name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
    }
}

/// Pipeline phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UploadPhase {
    #[default]
    Idle,
    Compressing,
    Uploading,
    Success,
    Error,
}

/// Observable pipeline status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadStatus {
    pub phase: UploadPhase,
    /// Advisory progress in `0..=100`
    pub progress: u8,
    /// User-facing message when `phase` is `Error`
    pub error: Option<String>,
}

/// Why a single upload failed. `Display` is the message shown to guests.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Solo se permiten imágenes.")]
    NotAnImage,

    #[error("La imagen es demasiado grande. Máximo permitido: {} MB.", mebibytes(.max_bytes))]
    TooLarge { max_bytes: usize },

    #[error("La imagen comprimida supera {} MB. Por favor usa una foto más pequeña.", mebibytes(.max_bytes))]
    CompressedTooLarge { max_bytes: usize },

    #[error("No se pudo subir la foto. Inténtalo de nuevo.")]
    Upload(#[source] StorageError),

    #[error("No se pudo guardar la foto. Inténtalo de nuevo.")]
    Record(#[source] StorageError),
}

fn mebibytes(bytes: &usize) -> String {
    if bytes % MEBIBYTE == 0 {
        (bytes / MEBIBYTE).to_string()
    } else {
        format!("{:.1}", *bytes as f64 / MEBIBYTE as f64)
    }
}

/// Size limits applied by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    /// Largest accepted image after compression
    pub max_final_bytes: usize,
    /// Gross limit is `max_final_bytes * gross_size_factor`
    pub gross_size_factor: usize,
    pub compress: CompressOptions,
}

impl UploadLimits {
    /// Largest file accepted before compression
    pub fn max_gross_bytes(&self) -> usize {
        self.max_final_bytes.saturating_mul(self.gross_size_factor)
    }
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_final_bytes: MAX_FINAL_BYTES,
            gross_size_factor: GROSS_SIZE_FACTOR,
            compress: CompressOptions::default(),
        }
    }
}

impl From<&UploadConfig> for UploadLimits {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_final_bytes: config.max_final_bytes,
            gross_size_factor: config.gross_size_factor,
            compress: CompressOptions::from(config),
        }
    }
}

/// Mint a URL-safe, collision-resistant object key:
/// `{unix millis}-{128-bit random hex}.{extension}`
pub fn mint_storage_key(extension: Option<&str>) -> String {
    let extension = extension
        .map(|ext| {
            ext.chars()
                .filter(char::is_ascii_alphanumeric)
                .take(10)
                .collect::<String>()
                .to_ascii_lowercase()
        })
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());

    format!(
        "{}-{}.{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple(),
        extension
    )
}

/// Publishes status to the watch channel and the caller's observer,
/// keeping progress monotonic within one run.
struct StatusEmitter<'a, F> {
    status: &'a watch::Sender<UploadStatus>,
    observer: F,
    progress: u8,
}

impl<F> StatusEmitter<'_, F>
where
    F: FnMut(&UploadStatus),
{
    fn emit(&mut self, phase: UploadPhase, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
        self.publish(UploadStatus {
            phase,
            progress: self.progress,
            error: None,
        });
    }

    fn fail(&mut self, message: String) {
        self.publish(UploadStatus {
            phase: UploadPhase::Error,
            progress: self.progress,
            error: Some(message),
        });
    }

    fn publish(&mut self, status: UploadStatus) {
        (self.observer)(&status);
        self.status.send_replace(status);
    }
}

/// Uploads one file at a time through the gateway
pub struct UploadPipeline {
    gateway: Arc<dyn StorageGateway>,
    compressor: Arc<dyn Compressor>,
    limits: UploadLimits,
    status: watch::Sender<UploadStatus>,
}

impl UploadPipeline {
    pub fn new(
        gateway: Arc<dyn StorageGateway>,
        compressor: Arc<dyn Compressor>,
        limits: UploadLimits,
    ) -> Self {
        let (status, _) = watch::channel(UploadStatus::default());
        Self {
            gateway,
            compressor,
            limits,
            status,
        }
    }

    /// Current status
    pub fn status(&self) -> UploadStatus {
        self.status.borrow().clone()
    }

    /// Follow status changes
    pub fn watch(&self) -> watch::Receiver<UploadStatus> {
        self.status.subscribe()
    }

    /// Return to idle with no progress and no error
    pub fn reset(&self) {
        self.status.send_replace(UploadStatus::default());
    }

    /// Upload one file. Returns whether the photo was stored and recorded.
    pub async fn upload_one(&self, file: &PickedFile, uploader_name: Option<&str>) -> bool {
        self.upload_one_observed(file, uploader_name, |_| {}).await
    }

    /// Like [`upload_one`](Self::upload_one), also handing every status event
    /// to `observer` as it happens.
    #[instrument(skip(self, file, uploader_name, observer), fields(file = %file.name, size_bytes = file.size_bytes()))]
    pub async fn upload_one_observed<F>(
        &self,
        file: &PickedFile,
        uploader_name: Option<&str>,
        observer: F,
    ) -> bool
    where
        F: FnMut(&UploadStatus) + Send,
    {
        // nothing from the previous run stays visible
        self.reset();

        let mut emitter = StatusEmitter {
            status: &self.status,
            observer,
            progress: 0,
        };

        match self.run(file, uploader_name, &mut emitter).await {
            Ok(photo) => {
                metrics::counter!("gallery.uploads.succeeded").increment(1);
                info!(photo_id = %photo.id, image_url = %photo.image_url, "Photo uploaded");
                true
            }
            Err(e) => {
                metrics::counter!("gallery.uploads.failed").increment(1);
                match &e {
                    UploadError::Upload(source) | UploadError::Record(source) => {
                        error!(error = %source, message = %e, "Photo upload failed")
                    }
                    _ => warn!(message = %e, "Photo rejected"),
                }
                emitter.fail(e.to_string());
                false
            }
        }
    }

    async fn run<F>(
        &self,
        file: &PickedFile,
        uploader_name: Option<&str>,
        emitter: &mut StatusEmitter<'_, F>,
    ) -> Result<Photo, UploadError>
    where
        F: FnMut(&UploadStatus),
    {
        if !file.is_image() {
            return Err(UploadError::NotAnImage);
        }

        let max_gross = self.limits.max_gross_bytes();
        if file.size_bytes() > max_gross {
            return Err(UploadError::TooLarge {
                max_bytes: max_gross,
            });
        }

        emitter.emit(UploadPhase::Compressing, 20);

        let (bytes, content_type) = match self
            .compressor
            .compress(file.bytes.clone(), self.limits.compress)
            .await
        {
            Ok(compressed) => {
                debug!(
                    original_bytes = file.size_bytes(),
                    compressed_bytes = compressed.bytes.len(),
                    "Compression finished"
                );
                (compressed.bytes, compressed.content_type)
            }
            Err(e) => {
                metrics::counter!("gallery.compression.fallbacks").increment(1);
                warn!(error = %e, "Compression failed, uploading original bytes");
                (file.bytes.clone(), file.content_type.clone())
            }
        };

        emitter.emit(UploadPhase::Compressing, 60);

        if bytes.len() > self.limits.max_final_bytes {
            return Err(UploadError::CompressedTooLarge {
                max_bytes: self.limits.max_final_bytes,
            });
        }

        let key = mint_storage_key(file.extension());
        debug!(key = %key, "Storage key minted");

        emitter.emit(UploadPhase::Uploading, 65);

        self.gateway
            .put_object(&key, bytes, &content_type)
            .await
            .map_err(UploadError::Upload)?;

        emitter.emit(UploadPhase::Uploading, 80);

        let image_url = self.gateway.public_url(&key);
        let photo = self
            .gateway
            .insert_photo_row(&NewPhoto::new(image_url, uploader_name))
            .await
            .map_err(UploadError::Record)?;

        emitter.emit(UploadPhase::Success, 100);

        Ok(photo)
    }
}
