//! Hosted store gateway: REST object storage, REST table API and the
//! websocket realtime channel, all authenticated with the anonymous key.

use super::realtime::{self, RealtimeSettings};
use super::{InsertSubscription, StorageError, StorageGateway};
use crate::config::Config;
use crate::model::{NewPhoto, Photo};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, instrument};

/// Gateway backed by the hosted store's HTTP APIs
pub struct SupabaseGateway {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    table: String,
    realtime: RealtimeSettings,
}

/// Error body returned by the storage and table APIs
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, rename = "statusCode")]
    status_code: Option<serde_json::Value>,
}

impl SupabaseGateway {
    /// Create a gateway from validated configuration
    pub fn new(config: &Config) -> Result<Self, StorageError> {
        let base_url = config.store_url();
        let anon_key = config.store.anon_key.clone().unwrap_or_default();

        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(&anon_key)
                .map_err(|e| StorageError::Request(format!("invalid anon key header value: {e}")))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {anon_key}"))
                .map_err(|e| StorageError::Request(format!("invalid anon key header value: {e}")))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| StorageError::Request(format!("failed to build HTTP client: {e}")))?;

        let realtime = RealtimeSettings::new(&base_url, &anon_key, &config.store.table, &config.feed)?;

        info!(
            url = %base_url,
            bucket = %config.store.bucket,
            table = %config.store.table,
            "Hosted store gateway initialized"
        );

        Ok(Self {
            client,
            base_url,
            bucket: config.store.bucket.clone(),
            table: config.store.table.clone(),
            realtime,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, key)
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }
}

#[async_trait]
impl StorageGateway for SupabaseGateway {
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .client
            .post(self.object_url(key))
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(key = %key, "Object stored");
            return Ok(());
        }

        let (message, duplicate) = read_error(response).await;
        if status == StatusCode::CONFLICT || duplicate {
            return Err(StorageError::Conflict(key.to_string()));
        }

        Err(StorageError::Status {
            status: status.as_u16(),
            message,
        })
    }

    fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, key
        )
    }

    #[instrument(skip(self, row))]
    async fn insert_photo_row(&self, row: &NewPhoto) -> Result<Photo, StorageError> {
        let response = self
            .client
            .post(self.table_url())
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let (message, _) = read_error(response).await;
            return Err(StorageError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let rows: Vec<Photo> = response
            .json()
            .await
            .map_err(|e| StorageError::Decode(e.to_string()))?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::Decode("insert returned no rows".to_string()))
    }

    #[instrument(skip(self))]
    async fn list_photos(&self) -> Result<Vec<Photo>, StorageError> {
        let response = self
            .client
            .get(format!("{}?select=*&order=created_at.desc", self.table_url()))
            .send()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let (message, _) = read_error(response).await;
            return Err(StorageError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let photos: Vec<Photo> = response
            .json()
            .await
            .map_err(|e| StorageError::Decode(e.to_string()))?;

        debug!(count = photos.len(), "Listed photos");

        Ok(photos)
    }

    async fn subscribe_inserts(&self) -> Result<InsertSubscription, StorageError> {
        Ok(realtime::subscribe(self.realtime.clone()))
    }
}

/// Read an error response into a message, flagging duplicate-object errors
async fn read_error(response: Response) -> (String, bool) {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    parse_error_body(status, &body)
}

fn parse_error_body(status: StatusCode, body: &str) -> (String, bool) {
    let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();

    let duplicate = parsed.error.as_deref() == Some("Duplicate")
        || match &parsed.status_code {
            Some(serde_json::Value::String(code)) => code == "409",
            Some(serde_json::Value::Number(code)) => code.as_u64() == Some(409),
            _ => false,
        };

    let message = parsed
        .message
        .or(parsed.error)
        .unwrap_or_else(|| {
            if body.is_empty() {
                status.to_string()
            } else {
                body.to_string()
            }
        });

    (message, duplicate)
}
