//! Wedding Gallery
//!
//! Client core for a shared wedding photo gallery. Guests pick photos, the
//! client compresses and uploads them one by one, records a row per photo,
//! and every connected client sees new photos appear live.
//!
//! ## Features
//!
//! - **Upload Pipeline**: Type and size validation, off-loop compression
//!   with fallback to the original bytes, collision-resistant object keys
//! - **Batch Uploads**: Sequential per-item processing with isolated
//!   failures and aggregate success/error counts
//! - **Live Feed**: Newest-first, deduplicated photo list fed by the realtime
//!   channel and reconciled by refetches after reconnects and batches
//! - **Pluggable Storage**: Hosted store over REST and websocket, or a
//!   self-hosted S3 bucket plus PostgreSQL with `LISTEN`/`NOTIFY`
//!
//! ## Architecture
//!
//! ```text
//!  Picked files                                   Object store   Table store
//! ┌──────────────┐  ┌──────────────┐             ┌───────────┐  ┌───────────┐
//! │ View         │─▶│ Batch        │             │ wedding-  │  │ photos    │
//! │ Adapter      │  │ Uploader     │             │ gallery/  │  │           │
//! └──────────────┘  └──────────────┘             └───────────┘  └───────────┘
//!        ▲                 │                           ▲              │ ▲
//!        │                 ▼                           │              │ │
//!        │          ┌──────────────┐  ┌──────────────┐ │              │ │
//!        │          │ Upload       │─▶│ Storage      │─┘──────────────┘ │
//!        │          │ Pipeline     │  │ Gateway      │◀─────────────────┘
//!        │          └──────────────┘  └──────────────┘   realtime inserts
//!        │                 │                 │
//!        │                 ▼                 ▼
//!        │          ┌──────────────┐  ┌──────────────┐
//!        │          │ Image        │  │ Photo        │
//!        └──────────│ Compressor   │  │ Feed         │
//!                   └──────────────┘  └──────────────┘
//! ```

pub mod batch;
pub mod compressor;
pub mod config;
pub mod feed;
pub mod gateway;
pub mod model;
pub mod pipeline;
pub mod preview;
pub mod view;

#[cfg(test)]
mod testing;

pub use batch::{BatchOutcome, BatchUploader, ItemStatus};
pub use compressor::{CompressOptions, CompressionError, Compressor, ImageCompressor};
pub use config::{Config, ConfigError};
pub use feed::{FeedOptions, FeedState, PhotoFeed};
pub use gateway::{InsertSubscription, RealtimeEvent, StorageError, StorageGateway};
pub use model::{NewPhoto, Photo};
pub use pipeline::{PickedFile, UploadError, UploadLimits, UploadPipeline, UploadStatus};
pub use preview::{InMemoryPreviews, PreviewHandle, PreviewRegistry};
pub use view::{GallerySnapshot, GalleryView, ViewOptions};
