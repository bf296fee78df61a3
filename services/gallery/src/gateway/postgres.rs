use super::{InsertSubscription, RealtimeEvent, StorageError};
use crate::config::DatabaseConfig;
use crate::model::{NewPhoto, Photo};
use backoff::{backoff::Backoff, ExponentialBackoff};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Notification channel the insert trigger publishes on
pub const INSERT_CHANNEL: &str = "photos_insert";

/// Photo table in PostgreSQL
pub struct PgPhotoTable {
    pool: PgPool,
    table: String,
}

impl PgPhotoTable {
    /// Connect to the database. `table` must already be a validated identifier.
    pub async fn new(config: &DatabaseConfig, table: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| StorageError::Database(format!("failed to connect to PostgreSQL: {e}")))?;

        info!(
            max_connections = config.max_connections,
            table = %table,
            "Connected to PostgreSQL"
        );

        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Database(format!("failed to run migrations: {e}")))?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Insert a photo row and return it as stored
    #[instrument(skip(self, row))]
    pub async fn insert(&self, row: &NewPhoto) -> Result<Photo, StorageError> {
        let photo = sqlx::query_as::<_, Photo>(&insert_sql(&self.table))
            .bind(&row.image_url)
            .bind(&row.uploader_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        debug!(photo_id = %photo.id, "Photo row inserted");

        Ok(photo)
    }

    /// All photos, newest first
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<Photo>, StorageError> {
        sqlx::query_as::<_, Photo>(&list_sql(&self.table))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    /// Subscribe to insert notifications published by the table trigger
    pub async fn listen(&self) -> Result<InsertSubscription, StorageError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        listener
            .listen(INSERT_CHANNEL)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let cancel = CancellationToken::new();
        let (tx, subscription) = InsertSubscription::channel(cancel.clone());
        tokio::spawn(run_listener(listener, tx, cancel));

        info!(channel = INSERT_CHANNEL, "Listening for photo inserts");

        Ok(subscription)
    }
}

async fn run_listener(
    mut listener: PgListener,
    tx: mpsc::UnboundedSender<RealtimeEvent>,
    cancel: CancellationToken,
) {
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..Default::default()
    };

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = listener.try_recv() => received,
        };

        let event = match received {
            Ok(Some(notification)) => {
                backoff.reset();
                match decode_notification(notification.payload()) {
                    Ok(photo) => RealtimeEvent::Insert(photo),
                    Err(e) => {
                        warn!(error = %e, "Skipping undecodable insert notification");
                        continue;
                    }
                }
            }
            // Connection dropped; the next receive reconnects and re-listens
            Ok(None) => {
                warn!(channel = INSERT_CHANNEL, "Notification connection lost");
                RealtimeEvent::Resynced
            }
            Err(e) => {
                let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                warn!(
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Notification listener failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };

        if tx.send(event).is_err() {
            break;
        }
    }

    debug!(channel = INSERT_CHANNEL, "Notification listener stopped");
}

fn decode_notification(payload: &str) -> Result<Photo, StorageError> {
    serde_json::from_str(payload).map_err(|e| StorageError::Decode(e.to_string()))
}

fn insert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (image_url, uploader_name) VALUES ($1, $2) \
         RETURNING id::text AS id, created_at, image_url, uploader_name"
    )
}

fn list_sql(table: &str) -> String {
    format!(
        "SELECT id::text AS id, created_at, image_url, uploader_name \
         FROM {table} ORDER BY created_at DESC, id DESC"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_trigger_payload() {
        // row_to_json output for a freshly inserted row
        let payload = r#"{"id":"0b5f2c1e-8a43-4f3e-9c51-7d2f0e6a1b2c","created_at":"2024-06-01T21:15:03.123456+00:00","image_url":"http://minio:9000/wedding-gallery/1-a.jpg","uploader_name":"Luis"}"#;

        let photo = decode_notification(payload).unwrap();
        assert_eq!(photo.id, "0b5f2c1e-8a43-4f3e-9c51-7d2f0e6a1b2c");
        assert_eq!(photo.uploader_name.as_deref(), Some("Luis"));
    }

    #[test]
    fn test_decode_rejects_partial_payload() {
        assert!(matches!(
            decode_notification(r#"{"id":"1"}"#),
            Err(StorageError::Decode(_))
        ));
    }

    #[test]
    fn test_queries_target_configured_table() {
        let insert = insert_sql("photos");
        assert!(insert.starts_with("INSERT INTO photos "));
        assert!(insert.contains("RETURNING id::text AS id"));

        let list = list_sql("photos");
        assert!(list.contains("FROM photos ORDER BY created_at DESC"));
    }
}
