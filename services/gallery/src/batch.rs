//! Sequential batch upload and the per-item state shown while it runs.

use crate::pipeline::{PickedFile, UploadPhase, UploadPipeline};
use crate::preview::{PreviewHandle, PreviewRegistry};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Status of one picked file.
///
/// `Pending -> Uploading -> {Done | Error}`; terminal states are final.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ItemStatus {
    #[default]
    Pending,
    Uploading,
    Done,
    Error,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Done | ItemStatus::Error)
    }

    fn can_become(self, next: ItemStatus) -> bool {
        match self {
            ItemStatus::Pending => next != ItemStatus::Pending,
            ItemStatus::Uploading => next != ItemStatus::Pending,
            ItemStatus::Done | ItemStatus::Error => false,
        }
    }
}

/// A change to one batch item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUpdate {
    pub index: usize,
    pub status: ItemStatus,
    pub progress: u8,
    pub error: Option<String>,
}

/// Aggregate result of a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub success_count: usize,
    pub error_count: usize,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.success_count + self.error_count
    }
}

/// Runs picked files through the pipeline one after another
pub struct BatchUploader {
    pipeline: Arc<UploadPipeline>,
}

impl BatchUploader {
    pub fn new(pipeline: Arc<UploadPipeline>) -> Self {
        Self { pipeline }
    }

    /// Upload `files` in order. Item `k + 1` starts only after item `k` is
    /// terminal; a failed item never stops the batch.
    #[instrument(skip(self, files, uploader_name, on_update), fields(count = files.len()))]
    pub async fn run_batch<F>(
        &self,
        files: &[PickedFile],
        uploader_name: Option<&str>,
        mut on_update: F,
    ) -> BatchOutcome
    where
        F: FnMut(ItemUpdate) + Send,
    {
        info!("Batch upload started");

        let mut outcome = BatchOutcome::default();

        for (index, file) in files.iter().enumerate() {
            on_update(ItemUpdate {
                index,
                status: ItemStatus::Uploading,
                progress: 0,
                error: None,
            });

            let mut failure = None;
            let ok = self
                .pipeline
                .upload_one_observed(file, uploader_name, |status| {
                    if status.phase == UploadPhase::Error {
                        failure = status.error.clone();
                    } else {
                        on_update(ItemUpdate {
                            index,
                            status: ItemStatus::Uploading,
                            progress: status.progress,
                            error: None,
                        });
                    }
                })
                .await;

            self.pipeline.reset();

            if ok {
                outcome.success_count += 1;
            } else {
                outcome.error_count += 1;
            }

            debug!(index, ok, "Batch item finished");

            on_update(ItemUpdate {
                index,
                status: if ok { ItemStatus::Done } else { ItemStatus::Error },
                progress: if ok { 100 } else { 0 },
                error: if ok { None } else { failure },
            });
        }

        info!(
            success_count = outcome.success_count,
            error_count = outcome.error_count,
            "Batch upload finished"
        );

        outcome
    }
}

/// A picked file with its preview and upload status
#[derive(Debug)]
pub struct FilePreview {
    pub file: PickedFile,
    pub preview: PreviewHandle,
    pub status: ItemStatus,
    pub progress: u8,
    pub error: Option<String>,
}

/// Lifecycle of the current selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchPhase {
    #[default]
    Idle,
    Running,
    Finished,
}

/// Selection, uploader name and progress of the batch being prepared or run
#[derive(Debug, Default)]
pub struct BatchState {
    items: Vec<FilePreview>,
    uploader_name: String,
    phase: BatchPhase,
    current: Option<usize>,
    outcome: Option<BatchOutcome>,
}

/// Read-only view of one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSnapshot {
    pub name: String,
    pub preview_url: String,
    pub status: ItemStatus,
    pub progress: u8,
    pub error: Option<String>,
}

/// Read-only view of the batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSnapshot {
    pub phase: BatchPhase,
    pub items: Vec<ItemSnapshot>,
    pub uploader_name: String,
    /// Items that reached a terminal status
    pub done_count: usize,
    /// 1-based position of the item being uploaded ("Subiendo k de n")
    pub current: Option<usize>,
    pub outcome: Option<BatchOutcome>,
}

impl BatchState {
    pub fn phase(&self) -> BatchPhase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.phase == BatchPhase::Running
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[FilePreview] {
        &self.items
    }

    pub fn uploader_name(&self) -> &str {
        &self.uploader_name
    }

    pub fn set_uploader_name(&mut self, name: String) {
        self.uploader_name = name;
    }

    /// Replace the selection. Previews of the previous selection are released.
    pub fn replace_selection(&mut self, files: Vec<PickedFile>, registry: &Arc<dyn PreviewRegistry>) {
        self.discard();
        self.items = files
            .into_iter()
            .map(|file| FilePreview {
                preview: PreviewHandle::create(registry, &file),
                file,
                status: ItemStatus::Pending,
                progress: 0,
                error: None,
            })
            .collect();
    }

    /// Mark the batch running and hand out the files to upload
    pub fn begin(&mut self) -> Vec<PickedFile> {
        self.phase = BatchPhase::Running;
        self.current = None;
        self.outcome = None;
        self.items.iter().map(|item| item.file.clone()).collect()
    }

    /// Apply an item update; transitions out of terminal states are ignored
    pub fn apply(&mut self, update: &ItemUpdate) {
        let Some(item) = self.items.get_mut(update.index) else {
            return;
        };
        if item.status != update.status && !item.status.can_become(update.status) {
            return;
        }
        if item.status.is_terminal() {
            return;
        }

        item.status = update.status;
        item.progress = update.progress;
        item.error = update.error.clone();

        self.current = (update.status == ItemStatus::Uploading).then_some(update.index + 1);
    }

    pub fn finish(&mut self, outcome: BatchOutcome) {
        self.phase = BatchPhase::Finished;
        self.current = None;
        self.outcome = Some(outcome);
    }

    /// Drop the selection, releasing every preview, and forget the name
    pub fn discard(&mut self) {
        for item in self.items.drain(..) {
            item.preview.release();
        }
        self.phase = BatchPhase::Idle;
        self.current = None;
        self.outcome = None;
    }

    /// Forget the uploader name as well as the selection
    pub fn clear(&mut self) {
        self.discard();
        self.uploader_name.clear();
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            phase: self.phase,
            items: self
                .items
                .iter()
                .map(|item| ItemSnapshot {
                    name: item.file.name.clone(),
                    preview_url: item.preview.url().to_string(),
                    status: item.status,
                    progress: item.progress,
                    error: item.error.clone(),
                })
                .collect(),
            uploader_name: self.uploader_name.clone(),
            done_count: self
                .items
                .iter()
                .filter(|item| item.status.is_terminal())
                .count(),
            current: self.current,
            outcome: self.outcome,
        }
    }
}
