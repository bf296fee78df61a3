//! In-process fakes shared by the unit tests.

use crate::compressor::{CompressOptions, CompressedImage, CompressionError, Compressor};
use crate::gateway::{InsertSubscription, RealtimeEvent, StorageError, StorageGateway};
use crate::model::{NewPhoto, Photo, BUCKET_NAME};
use crate::pipeline::PickedFile;
use crate::preview::PreviewRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// JPEG-declared file of `len` zero bytes
pub fn image_file(name: &str, len: usize) -> PickedFile {
    PickedFile::new(name, "image/jpeg", Bytes::from(vec![0u8; len]))
}

/// Photo with a timestamp `seconds` after a fixed epoch
pub fn photo_at(id: &str, seconds: i64) -> Photo {
    Photo {
        id: id.to_string(),
        created_at: base_time() + ChronoDuration::seconds(seconds),
        image_url: format!("https://fake.storage/{BUCKET_NAME}/{id}.jpg"),
        uploader_name: None,
    }
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 20, 0, 0).unwrap()
}

#[derive(Default)]
struct FakeState {
    objects: HashMap<String, (Bytes, String)>,
    rows: Vec<Photo>,
    clock: i64,
    put_calls: usize,
    insert_calls: usize,
    list_calls: usize,
    fail_put: HashSet<usize>,
    fail_insert: HashSet<usize>,
    subscribers: Vec<(mpsc::UnboundedSender<RealtimeEvent>, CancellationToken)>,
}

/// Object store, table store and realtime channel in memory.
///
/// Inserted rows get ids `photo-N` and strictly increasing timestamps, and
/// are broadcast to live subscribers unless realtime delivery is muted.
pub struct FakeGateway {
    state: Mutex<FakeState>,
    fail_list: AtomicBool,
    mute_realtime: AtomicBool,
    list_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                clock: 1_000,
                ..Default::default()
            }),
            fail_list: AtomicBool::new(false),
            mute_realtime: AtomicBool::new(false),
            list_gate: Mutex::new(None),
        }
    }

    /// Put rows straight into the table without notifying anyone
    pub fn seed(&self, photos: Vec<Photo>) {
        self.state.lock().rows.extend(photos);
    }

    /// Fail the `n`th put (1-based)
    pub fn fail_put_on(&self, n: usize) {
        self.state.lock().fail_put.insert(n);
    }

    /// Fail the `n`th insert (1-based)
    pub fn fail_insert_on(&self, n: usize) {
        self.state.lock().fail_insert.insert(n);
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// Stop broadcasting inserts to subscribers
    pub fn mute_realtime(&self) {
        self.mute_realtime.store(true, Ordering::SeqCst);
    }

    /// Hold every `list_photos` call until [`release_list`](Self::release_list)
    pub fn gate_list(&self) {
        *self.list_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let one gated `list_photos` call through
    pub fn release_list(&self) {
        if let Some(gate) = self.list_gate.lock().as_ref() {
            gate.add_permits(1);
        }
    }

    /// Deliver an event to every live subscriber
    pub fn emit(&self, event: RealtimeEvent) {
        let state = self.state.lock();
        for (tx, token) in &state.subscribers {
            if !token.is_cancelled() {
                let _ = tx.send(event.clone());
            }
        }
    }

    pub fn rows(&self) -> Vec<Photo> {
        self.state.lock().rows.clone()
    }

    pub fn object(&self, key: &str) -> Option<(Bytes, String)> {
        self.state.lock().objects.get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    pub fn subscriptions(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Subscriptions that have not been cancelled
    pub fn active_subscriptions(&self) -> usize {
        self.state
            .lock()
            .subscribers
            .iter()
            .filter(|(_, token)| !token.is_cancelled())
            .count()
    }
}

#[async_trait]
impl StorageGateway for FakeGateway {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        // behave like a network call and let other tasks run
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        state.put_calls += 1;
        if state.fail_put.contains(&state.put_calls) {
            return Err(StorageError::Status {
                status: 500,
                message: "injected put failure".to_string(),
            });
        }
        if state.objects.contains_key(key) {
            return Err(StorageError::Conflict(key.to_string()));
        }
        state
            .objects
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("https://fake.storage/{BUCKET_NAME}/{key}")
    }

    async fn insert_photo_row(&self, row: &NewPhoto) -> Result<Photo, StorageError> {
        tokio::task::yield_now().await;

        let photo = {
            let mut state = self.state.lock();
            state.insert_calls += 1;
            if state.fail_insert.contains(&state.insert_calls) {
                return Err(StorageError::Status {
                    status: 500,
                    message: "injected insert failure".to_string(),
                });
            }
            state.clock += 1;
            let photo = Photo {
                id: format!("photo-{}", state.insert_calls),
                created_at: base_time() + ChronoDuration::seconds(state.clock),
                image_url: row.image_url.clone(),
                uploader_name: row.uploader_name.clone(),
            };
            state.rows.push(photo.clone());
            photo
        };

        if !self.mute_realtime.load(Ordering::SeqCst) {
            self.emit(RealtimeEvent::Insert(photo.clone()));
        }

        Ok(photo)
    }

    async fn list_photos(&self) -> Result<Vec<Photo>, StorageError> {
        self.state.lock().list_calls += 1;

        let gate = self.list_gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        if self.fail_list.load(Ordering::SeqCst) {
            return Err(StorageError::Request("injected list failure".to_string()));
        }

        let mut rows = self.state.lock().rows.clone();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn subscribe_inserts(&self) -> Result<InsertSubscription, StorageError> {
        let token = CancellationToken::new();
        let (tx, subscription) = InsertSubscription::channel(token.clone());
        self.state.lock().subscribers.push((tx, token));
        Ok(subscription)
    }
}

enum CompressorMode {
    Passthrough,
    Fixed(usize),
    Failing,
}

/// Compressor with a scripted result
pub struct FakeCompressor {
    mode: CompressorMode,
    calls: Arc<AtomicUsize>,
}

impl FakeCompressor {
    /// Return the input unchanged
    pub fn passthrough() -> Self {
        Self::with_mode(CompressorMode::Passthrough)
    }

    /// Return `len` bytes of JPEG regardless of input
    pub fn fixed(len: usize) -> Self {
        Self::with_mode(CompressorMode::Fixed(len))
    }

    /// Reject every input as undecodable
    pub fn failing() -> Self {
        Self::with_mode(CompressorMode::Failing)
    }

    fn with_mode(mode: CompressorMode) -> Self {
        Self {
            mode,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Compressor for FakeCompressor {
    async fn compress(
        &self,
        bytes: Bytes,
        _options: CompressOptions,
    ) -> Result<CompressedImage, CompressionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = match self.mode {
            CompressorMode::Passthrough => bytes,
            CompressorMode::Fixed(len) => Bytes::from(vec![1u8; len]),
            CompressorMode::Failing => {
                return Err(CompressionError::Decode("scripted failure".to_string()))
            }
        };
        Ok(CompressedImage {
            bytes,
            content_type: "image/jpeg".to_string(),
            width: 1920,
            height: 1080,
        })
    }
}

/// Preview registry recording every create and revoke
#[derive(Default)]
pub struct RecordingPreviews {
    created: Mutex<Vec<String>>,
    revoked: Mutex<Vec<String>>,
}

impl RecordingPreviews {
    pub fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().clone()
    }

    /// Created URLs not yet revoked
    pub fn live(&self) -> Vec<String> {
        let revoked = self.revoked.lock();
        self.created
            .lock()
            .iter()
            .filter(|url| !revoked.contains(url))
            .cloned()
            .collect()
    }
}

impl PreviewRegistry for RecordingPreviews {
    fn create(&self, file: &PickedFile) -> String {
        let mut created = self.created.lock();
        let url = format!("blob:test/{}-{}", created.len(), file.name);
        created.push(url.clone());
        url
    }

    fn revoke(&self, url: &str) {
        self.revoked.lock().push(url.to_string());
    }
}
