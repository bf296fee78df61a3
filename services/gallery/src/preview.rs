//! Local preview URLs for picked files.
//!
//! A [`PreviewHandle`] owns one URL issued by a [`PreviewRegistry`] and
//! revokes it exactly once: explicitly through [`PreviewHandle::release`] or
//! implicitly when dropped.

use crate::pipeline::PickedFile;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Issues and revokes preview URLs
pub trait PreviewRegistry: Send + Sync {
    /// Create a URL referencing `file`'s bytes
    fn create(&self, file: &PickedFile) -> String;

    /// Release a URL created by this registry
    fn revoke(&self, url: &str);
}

/// Owned preview URL
pub struct PreviewHandle {
    url: String,
    registry: Arc<dyn PreviewRegistry>,
    released: bool,
}

impl PreviewHandle {
    pub fn create(registry: &Arc<dyn PreviewRegistry>, file: &PickedFile) -> Self {
        Self {
            url: registry.create(file),
            registry: registry.clone(),
            released: false,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Revoke the URL now
    pub fn release(mut self) {
        self.revoke_once();
    }

    fn revoke_once(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.revoke(&self.url);
        }
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        self.revoke_once();
    }
}

impl fmt::Debug for PreviewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewHandle")
            .field("url", &self.url)
            .field("released", &self.released)
            .finish()
    }
}

/// Registry keeping preview bytes in memory under `blob:` URLs
#[derive(Default)]
pub struct InMemoryPreviews {
    entries: Mutex<HashMap<String, Bytes>>,
}

impl InMemoryPreviews {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live URLs
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl PreviewRegistry for InMemoryPreviews {
    fn create(&self, file: &PickedFile) -> String {
        let url = format!("blob:wedding-gallery/{}", Uuid::new_v4());
        self.entries.lock().insert(url.clone(), file.bytes.clone());
        url
    }

    fn revoke(&self, url: &str) {
        self.entries.lock().remove(url);
    }
}
