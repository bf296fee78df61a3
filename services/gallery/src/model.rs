//! Photo records and the value rules shared by every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Largest accepted image after compression (2 MiB)
pub const MAX_FINAL_BYTES: usize = 2 * 1024 * 1024;

/// Files larger than `MAX_FINAL_BYTES * GROSS_SIZE_FACTOR` are rejected before compression
pub const GROSS_SIZE_FACTOR: usize = 3;

/// Compression target (~300 KiB)
pub const TARGET_BYTES: usize = 300 * 1024;

/// Longest edge of a compressed image
pub const MAX_EDGE_PIXELS: u32 = 1920;

/// Maximum length of an uploader name, in characters
pub const MAX_UPLOADER_NAME_CHARS: usize = 50;

/// Bucket holding the uploaded images
pub const BUCKET_NAME: &str = "wedding-gallery";

/// Table holding one row per photo
pub const PHOTOS_TABLE: &str = "photos";

/// A photo row as persisted by the table store.
///
/// `id` and `created_at` are assigned by the store on insert; the
/// `(id, created_at, image_url)` tuple never changes once observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Photo {
    /// Opaque unique identifier
    pub id: String,
    /// Insert timestamp assigned by the store
    #[serde(with = "timestamp_serde")]
    pub created_at: DateTime<Utc>,
    /// Public URL of the image bytes
    pub image_url: String,
    /// Optional display name of the guest who uploaded it
    #[serde(default)]
    pub uploader_name: Option<String>,
}

/// Client-writable columns of a new photo row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewPhoto {
    pub image_url: String,
    pub uploader_name: Option<String>,
}

impl NewPhoto {
    /// Build a row, normalising the uploader name.
    pub fn new(image_url: impl Into<String>, uploader_name: Option<&str>) -> Self {
        Self {
            image_url: image_url.into(),
            uploader_name: uploader_name.and_then(normalize_uploader_name),
        }
    }
}

/// Trim an uploader name; empty or whitespace-only names become `None`.
///
/// Names longer than [`MAX_UPLOADER_NAME_CHARS`] are cut at that many characters.
pub fn normalize_uploader_name(raw: &str) -> Option<String> {
    let trimmed = clamp_uploader_input(raw.trim());
    let trimmed = trimmed.trim_end();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Limit raw name input to [`MAX_UPLOADER_NAME_CHARS`] characters, as a text field would.
pub fn clamp_uploader_input(raw: &str) -> String {
    raw.chars().take(MAX_UPLOADER_NAME_CHARS).collect()
}

/// Store timestamps arrive either as RFC 3339 (`2024-01-15T10:30:00.123+00:00`)
/// or in Postgres text form (`2024-01-15 10:30:00.123+00`).
mod timestamp_serde {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z")
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| format!("invalid timestamp {raw:?}: {e}"))
    }
}
