//! View adapter: turns feed and batch state into snapshots and exposes the
//! intents a presentation layer calls.
//!
//! The adapter owns every preview handle of the current selection and
//! releases them when the selection is replaced, when the modal closes
//! (manually or by auto-close) and when the adapter is disposed.

use crate::batch::{BatchOutcome, BatchPhase, BatchSnapshot, BatchState, BatchUploader};
use crate::config::Config;
use crate::feed::{FeedState, PhotoFeed};
use crate::model::{clamp_uploader_input, normalize_uploader_name, Photo};
use crate::pipeline::{PickedFile, UploadPipeline};
use crate::preview::PreviewRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewOptions {
    /// Delay between a batch with successes and the feed refresh
    pub refresh_delay: Duration,
    /// Delay between a finished batch and the modal closing itself
    pub auto_close: Duration,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            refresh_delay: Duration::from_millis(800),
            auto_close: Duration::from_millis(2200),
        }
    }
}

impl From<&Config> for ViewOptions {
    fn from(config: &Config) -> Self {
        Self {
            refresh_delay: config.feed.refresh_delay(),
            auto_close: config.modal.auto_close_delay(),
        }
    }
}

/// Upload modal as the presentation layer sees it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModalSnapshot {
    pub open: bool,
    /// False while a batch runs
    pub can_close: bool,
    pub batch: BatchSnapshot,
}

/// Photo shown in the lightbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightboxView {
    pub index: usize,
    pub total: usize,
    pub photo: Photo,
    pub has_prev: bool,
    pub has_next: bool,
}

/// Everything the presentation layer renders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GallerySnapshot {
    pub feed: FeedState,
    pub modal: ModalSnapshot,
    pub lightbox: Option<LightboxView>,
}

#[derive(Default)]
struct ModalState {
    open: bool,
    batch: BatchState,
    /// Bumped whenever the selection is replaced or the modal closes
    generation: u64,
}

struct ModalShared {
    state: Mutex<ModalState>,
    snapshots: watch::Sender<ModalSnapshot>,
    pipeline: Arc<UploadPipeline>,
}

impl ModalShared {
    fn publish(&self) {
        let snapshot = {
            let state = self.state.lock();
            ModalSnapshot {
                open: state.open,
                can_close: !state.batch.is_running(),
                batch: state.batch.snapshot(),
            }
        };
        self.snapshots.send_replace(snapshot);
    }

    /// Close unless a batch is running. Releases the selection's previews.
    fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.batch.is_running() {
                return false;
            }
            state.open = false;
            state.batch.clear();
            state.generation += 1;
        }
        self.pipeline.reset();
        self.publish();
        true
    }

    fn close_if_finished(&self, generation: u64) {
        let finished = {
            let state = self.state.lock();
            state.open
                && state.generation == generation
                && state.batch.phase() == BatchPhase::Finished
        };
        if finished && self.close() {
            debug!("Upload modal closed automatically");
        }
    }

    fn dispose(&self) {
        {
            let mut state = self.state.lock();
            state.open = false;
            state.batch.clear();
            state.generation += 1;
        }
        self.publish();
    }
}

/// The gallery page's view adapter
pub struct GalleryView {
    feed: Arc<PhotoFeed>,
    uploader: BatchUploader,
    previews: Arc<dyn PreviewRegistry>,
    modal: Arc<ModalShared>,
    lightbox: Mutex<Option<usize>>,
    options: ViewOptions,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl GalleryView {
    pub fn new(
        feed: Arc<PhotoFeed>,
        pipeline: Arc<UploadPipeline>,
        previews: Arc<dyn PreviewRegistry>,
        options: ViewOptions,
    ) -> Self {
        let (snapshots, _) = watch::channel(ModalSnapshot {
            can_close: true,
            ..Default::default()
        });

        Self {
            feed,
            uploader: BatchUploader::new(pipeline.clone()),
            previews,
            modal: Arc::new(ModalShared {
                state: Mutex::new(ModalState::default()),
                snapshots,
                pipeline,
            }),
            lightbox: Mutex::new(None),
            options,
            timers: Mutex::new(Vec::new()),
        }
    }

    pub fn feed(&self) -> &Arc<PhotoFeed> {
        &self.feed
    }

    /// Current state of the whole page
    pub fn snapshot(&self) -> GallerySnapshot {
        GallerySnapshot {
            feed: self.feed.snapshot(),
            modal: self.modal.snapshots.borrow().clone(),
            lightbox: self.lightbox(),
        }
    }

    /// Follow modal changes
    pub fn watch_modal(&self) -> watch::Receiver<ModalSnapshot> {
        self.modal.snapshots.subscribe()
    }

    /// Follow feed changes
    pub fn watch_feed(&self) -> watch::Receiver<FeedState> {
        self.feed.watch()
    }

    pub fn open_modal(&self) {
        self.modal.state.lock().open = true;
        self.modal.publish();
    }

    /// Close the modal, discarding the selection and the name. Inert while
    /// a batch runs; returns whether it closed.
    pub fn close_modal(&self) -> bool {
        self.modal.close()
    }

    /// Replace the selection. Ignored while a batch runs or when `files` is
    /// empty; returns whether the selection changed.
    pub fn pick_files(&self, files: Vec<PickedFile>) -> bool {
        if files.is_empty() {
            return false;
        }
        {
            let mut state = self.modal.state.lock();
            if state.batch.is_running() {
                return false;
            }
            state.batch.replace_selection(files, &self.previews);
            state.generation += 1;
        }
        self.modal.publish();
        true
    }

    /// Set the uploader name, limited to the name field's length
    pub fn set_uploader_name(&self, name: &str) {
        {
            let mut state = self.modal.state.lock();
            if state.batch.is_running() {
                return;
            }
            state.batch.set_uploader_name(clamp_uploader_input(name));
        }
        self.modal.publish();
    }

    /// Upload the current selection. Returns `None` when there is nothing
    /// to upload or a batch is already running.
    pub async fn start_upload(&self) -> Option<BatchOutcome> {
        let (files, uploader_name) = {
            let mut state = self.modal.state.lock();
            if state.batch.is_empty() || state.batch.phase() != BatchPhase::Idle {
                return None;
            }
            let name = normalize_uploader_name(state.batch.uploader_name());
            (state.batch.begin(), name)
        };
        self.modal.publish();

        let modal = self.modal.clone();
        let outcome = self
            .uploader
            .run_batch(&files, uploader_name.as_deref(), |update| {
                modal.state.lock().batch.apply(&update);
                modal.publish();
            })
            .await;

        let generation = {
            let mut state = self.modal.state.lock();
            state.batch.finish(outcome);
            state.generation
        };
        self.modal.publish();

        info!(
            success_count = outcome.success_count,
            error_count = outcome.error_count,
            "Upload finished"
        );

        if outcome.success_count > 0 {
            let feed = self.feed.clone();
            let delay = self.options.refresh_delay;
            self.schedule(async move {
                tokio::time::sleep(delay).await;
                feed.refetch().await;
            });
        }

        let modal = self.modal.clone();
        let delay = self.options.auto_close;
        self.schedule(async move {
            tokio::time::sleep(delay).await;
            modal.close_if_finished(generation);
        });

        Some(outcome)
    }

    /// Refetch the feed now
    pub async fn refresh(&self) {
        self.feed.refetch().await
    }

    /// Open the lightbox at `index`; returns false when out of range
    pub fn open_photo(&self, index: usize) -> bool {
        if index >= self.feed.photo_count() {
            return false;
        }
        *self.lightbox.lock() = Some(index);
        true
    }

    pub fn close_photo(&self) {
        *self.lightbox.lock() = None;
    }

    /// Step to the next (older) photo; false at the end
    pub fn next_photo(&self) -> bool {
        let Some(current) = self.lightbox() else {
            return false;
        };
        if !current.has_next {
            return false;
        }
        *self.lightbox.lock() = Some(current.index + 1);
        true
    }

    /// Step to the previous (newer) photo; false at the start
    pub fn prev_photo(&self) -> bool {
        let Some(current) = self.lightbox() else {
            return false;
        };
        if !current.has_prev {
            return false;
        }
        *self.lightbox.lock() = Some(current.index - 1);
        true
    }

    /// The open lightbox, its index clamped to the current feed
    pub fn lightbox(&self) -> Option<LightboxView> {
        let index = (*self.lightbox.lock())?;
        let photos = self.feed.snapshot().photos;
        let total = photos.len();
        if total == 0 {
            return None;
        }
        let index = index.min(total - 1);

        Some(LightboxView {
            index,
            total,
            photo: photos[index].clone(),
            has_prev: index > 0,
            has_next: index + 1 < total,
        })
    }

    /// Release every preview, cancel timers and dispose the feed. Idempotent.
    pub fn dispose(&self) {
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
        self.modal.dispose();
        *self.lightbox.lock() = None;
        self.feed.dispose();
    }

    fn schedule<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut timers = self.timers.lock();
        timers.retain(|timer| !timer.is_finished());
        timers.push(tokio::spawn(task));
    }
}

impl Drop for GalleryView {
    fn drop(&mut self) {
        self.dispose();
    }
}
