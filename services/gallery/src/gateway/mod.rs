//! Storage gateway: the only component that knows which vendor stores the
//! photos.
//!
//! Everything else consumes the five capabilities of [`StorageGateway`]:
//! put an object, derive its public URL, insert a photo row, list photos and
//! subscribe to row inserts.

pub mod postgres;
pub mod realtime;
pub mod s3;
pub mod self_hosted;
pub mod supabase;

use crate::config::{Config, StoreBackend};
use crate::model::{NewPhoto, Photo};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use self_hosted::SelfHostedGateway;
pub use supabase::SupabaseGateway;

/// Errors raised by the object store, the table store or the realtime layer
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Store returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Object key already exists: {0}")]
    Conflict(String),

    #[error("Failed to decode store response: {0}")]
    Decode(String),

    #[error("Realtime channel error: {0}")]
    Realtime(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Object store error: {0}")]
    ObjectStore(String),
}

/// An event delivered by an insert subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    /// A photo row was inserted
    Insert(Photo),
    /// The channel reconnected; inserts may have been missed meanwhile
    Resynced,
}

/// Handle to a live insert subscription.
///
/// Events arrive in delivery order through [`recv`](Self::recv). Cancelling
/// is idempotent and releases the underlying channel; dropping the handle
/// cancels it.
#[derive(Debug)]
pub struct InsertSubscription {
    events: mpsc::UnboundedReceiver<RealtimeEvent>,
    cancel: CancellationToken,
}

impl InsertSubscription {
    /// Create a subscription and the sender a backend task feeds.
    ///
    /// The backend task should stop once `cancel` fires or the sender
    /// reports the receiver closed.
    pub fn channel(cancel: CancellationToken) -> (mpsc::UnboundedSender<RealtimeEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { events: rx, cancel })
    }

    /// Wait for the next event. Returns `None` once cancelled or when the
    /// backend has stopped delivering.
    pub async fn recv(&mut self) -> Option<RealtimeEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Cancel the subscription. Safe to call any number of times.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the subscription has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that cancels this subscription from elsewhere
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for InsertSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Capability surface over the external object store and table store
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Upload `bytes` under `key`. An existing key is a [`StorageError::Conflict`].
    async fn put_object(&self, key: &str, bytes: Bytes, content_type: &str)
        -> Result<(), StorageError>;

    /// Public, unauthenticated URL of the object stored under `key`
    fn public_url(&self, key: &str) -> String;

    /// Insert a photo row and return it with its store-assigned fields
    async fn insert_photo_row(&self, row: &NewPhoto) -> Result<Photo, StorageError>;

    /// All photos, newest first
    async fn list_photos(&self) -> Result<Vec<Photo>, StorageError>;

    /// Subscribe to row inserts. Delivery is best-effort.
    async fn subscribe_inserts(&self) -> Result<InsertSubscription, StorageError>;
}

/// Build the gateway selected by configuration
pub async fn connect(config: &Config) -> Result<Arc<dyn StorageGateway>, StorageError> {
    let gateway: Arc<dyn StorageGateway> = match config.store.backend {
        StoreBackend::Supabase => Arc::new(SupabaseGateway::new(config)?),
        StoreBackend::SelfHosted => Arc::new(SelfHostedGateway::connect(config).await?),
    };

    info!(backend = ?config.store.backend, "Storage gateway initialized");

    Ok(gateway)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn photo(id: &str) -> Photo {
        Photo {
            id: id.to_string(),
            created_at: Utc::now(),
            image_url: format!("https://cdn.example/{id}.jpg"),
            uploader_name: None,
        }
    }

    #[tokio::test]
    async fn test_subscription_delivers_in_order() {
        let (tx, mut sub) = InsertSubscription::channel(CancellationToken::new());
        let first = photo("a");
        tx.send(RealtimeEvent::Insert(first.clone())).unwrap();
        tx.send(RealtimeEvent::Resynced).unwrap();

        assert_eq!(sub.recv().await, Some(RealtimeEvent::Insert(first)));
        assert_eq!(sub.recv().await, Some(RealtimeEvent::Resynced));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_stops_delivery() {
        let token = CancellationToken::new();
        let (tx, mut sub) = InsertSubscription::channel(token.clone());

        sub.cancel();
        sub.cancel();

        assert!(sub.is_cancelled());
        assert!(token.is_cancelled());
        let _ = tx.send(RealtimeEvent::Resynced);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let token = CancellationToken::new();
        let (_tx, sub) = InsertSubscription::channel(token.clone());
        drop(sub);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_closed_sender_ends_stream() {
        let (tx, mut sub) = InsertSubscription::channel(CancellationToken::new());
        drop(tx);
        assert_eq!(sub.recv().await, None);
    }
}
