//! Self-hosted gateway: images in an S3-compatible bucket, rows in
//! PostgreSQL, inserts pushed through `LISTEN`/`NOTIFY`.

use super::postgres::PgPhotoTable;
use super::s3::S3ObjectStore;
use super::{InsertSubscription, StorageError, StorageGateway};
use crate::config::Config;
use crate::model::{NewPhoto, Photo};
use async_trait::async_trait;
use bytes::Bytes;

pub struct SelfHostedGateway {
    objects: S3ObjectStore,
    table: PgPhotoTable,
}

impl SelfHostedGateway {
    /// Connect both stores, running migrations when configured
    pub async fn connect(config: &Config) -> Result<Self, StorageError> {
        let s3 = config
            .s3
            .as_ref()
            .ok_or_else(|| StorageError::ObjectStore("missing s3 configuration".to_string()))?;
        let database = config
            .database
            .as_ref()
            .ok_or_else(|| StorageError::Database("missing database configuration".to_string()))?;

        let table = PgPhotoTable::new(database, &config.store.table).await?;
        if database.run_migrations {
            table.run_migrations().await?;
        }

        let objects = S3ObjectStore::new(s3).await;

        Ok(Self { objects, table })
    }
}

#[async_trait]
impl StorageGateway for SelfHostedGateway {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.objects.put(key, bytes, content_type).await
    }

    fn public_url(&self, key: &str) -> String {
        self.objects.public_url(key)
    }

    async fn insert_photo_row(&self, row: &NewPhoto) -> Result<Photo, StorageError> {
        self.table.insert(row).await
    }

    async fn list_photos(&self) -> Result<Vec<Photo>, StorageError> {
        self.table.list().await
    }

    async fn subscribe_inserts(&self) -> Result<InsertSubscription, StorageError> {
        self.table.listen().await
    }
}
