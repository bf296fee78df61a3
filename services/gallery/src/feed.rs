//! Live, deduplicated, newest-first list of photos.
//!
//! The feed fetches the table once on start, subscribes to inserts
//! regardless of the fetch outcome, and prepends every photo it has not seen
//! yet. A fetch merges realtime-delivered photos missing from its result, so
//! an insert seen before the fetch completes is never lost or duplicated.

use crate::config::FeedConfig;
use crate::gateway::{InsertSubscription, RealtimeEvent, StorageError, StorageGateway};
use crate::model::Photo;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Banner text when photos cannot be loaded
pub const FETCH_ERROR_MESSAGE: &str = "Error al cargar fotos";

/// Observable feed state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedState {
    /// Photos, newest first, unique by id
    pub photos: Vec<Photo>,
    pub loading: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FeedOptions {
    /// Refetch on this interval to reconcile missed inserts
    pub reconcile_every: Option<Duration>,
}

impl From<&FeedConfig> for FeedOptions {
    fn from(config: &FeedConfig) -> Self {
        Self {
            reconcile_every: config.reconcile_interval(),
        }
    }
}

struct FeedShared {
    gateway: Arc<dyn StorageGateway>,
    state: watch::Sender<FeedState>,
    /// Ids delivered by the realtime channel
    live_ids: Mutex<HashSet<String>>,
    fetches_issued: AtomicU64,
    fetches_applied: AtomicU64,
    cancel: CancellationToken,
}

impl FeedShared {
    fn new(gateway: Arc<dyn StorageGateway>) -> Self {
        let (state, _) = watch::channel(FeedState {
            photos: Vec::new(),
            loading: true,
            error: None,
        });

        Self {
            gateway,
            state,
            live_ids: Mutex::new(HashSet::new()),
            fetches_issued: AtomicU64::new(0),
            fetches_applied: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    fn on_insert(&self, photo: Photo) {
        let id = photo.id.clone();
        self.live_ids.lock().insert(id.clone());

        let inserted = self.state.send_if_modified(|state| {
            if state.photos.iter().any(|p| p.id == photo.id) {
                false
            } else {
                state.photos.insert(0, photo);
                true
            }
        });

        if inserted {
            metrics::counter!("gallery.feed.inserts").increment(1);
            debug!(photo_id = %id, "Photo added to feed");
        } else {
            metrics::counter!("gallery.feed.duplicates").increment(1);
            debug!(photo_id = %id, "Duplicate insert ignored");
        }
    }

    #[instrument(skip(self))]
    async fn refetch(&self) {
        if self.cancel.is_cancelled() {
            return;
        }

        let seq = self.fetches_issued.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self.gateway.list_photos().await;

        if self.cancel.is_cancelled() {
            return;
        }
        self.apply_fetch(seq, result);
    }

    /// Apply the result of fetch number `seq`; returns false when a newer
    /// fetch has already been applied.
    fn apply_fetch(&self, seq: u64, result: Result<Vec<Photo>, StorageError>) -> bool {
        let summary = result
            .as_ref()
            .map(Vec::len)
            .map_err(ToString::to_string);

        // ordering check and merge happen under the state lock
        let applied = self.state.send_if_modified(|state| {
            if self.fetches_applied.fetch_max(seq, Ordering::SeqCst) > seq {
                return false;
            }
            match result {
                Ok(fetched) => {
                    let live_ids = self.live_ids.lock();
                    state.photos = merge(fetched, &state.photos, &live_ids);
                    state.error = None;
                }
                Err(_) => state.error = Some(FETCH_ERROR_MESSAGE.to_string()),
            }
            state.loading = false;
            true
        });

        match (applied, summary) {
            (false, _) => debug!(seq, "Discarding stale fetch"),
            (true, Ok(count)) => debug!(count, "Photos fetched"),
            (true, Err(e)) => warn!(error = %e, "Failed to fetch photos"),
        }
        applied
    }
}

/// Fetched rows plus realtime photos they do not contain yet, newest first
fn merge(fetched: Vec<Photo>, current: &[Photo], live_ids: &HashSet<String>) -> Vec<Photo> {
    let mut seen: HashSet<String> = HashSet::with_capacity(fetched.len());
    let mut merged = Vec::with_capacity(fetched.len());

    for photo in fetched {
        if seen.insert(photo.id.clone()) {
            merged.push(photo);
        }
    }
    for photo in current {
        if live_ids.contains(&photo.id) && seen.insert(photo.id.clone()) {
            merged.push(photo.clone());
        }
    }

    merged.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    merged
}

/// The photo feed. Dispose it (or drop it) to release the subscription.
pub struct PhotoFeed {
    shared: Arc<FeedShared>,
    subscription: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PhotoFeed {
    /// Start fetching and listening
    pub async fn start(gateway: Arc<dyn StorageGateway>, options: FeedOptions) -> Self {
        let shared = Arc::new(FeedShared::new(gateway.clone()));

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn({
            let shared = shared.clone();
            async move { shared.refetch().await }
        }));

        let mut subscription_token = None;
        match gateway.subscribe_inserts().await {
            Ok(subscription) => {
                subscription_token = Some(subscription.cancel_token());
                tasks.push(tokio::spawn(listen(shared.clone(), subscription)));
            }
            Err(e) => warn!(error = %e, "Realtime subscription failed; feed updates on refresh only"),
        }

        if let Some(every) = options.reconcile_every {
            tasks.push(tokio::spawn(reconcile(shared.clone(), every)));
        }

        info!(
            realtime = subscription_token.is_some(),
            reconcile_secs = options.reconcile_every.map(|d| d.as_secs()),
            "Photo feed started"
        );

        Self {
            shared,
            subscription: Mutex::new(subscription_token),
            tasks: Mutex::new(tasks),
        }
    }

    /// Current state
    pub fn snapshot(&self) -> FeedState {
        self.shared.state.borrow().clone()
    }

    /// Follow state changes
    pub fn watch(&self) -> watch::Receiver<FeedState> {
        self.shared.state.subscribe()
    }

    /// Number of shared photos
    pub fn photo_count(&self) -> usize {
        self.shared.state.borrow().photos.len()
    }

    /// Re-read the table and replace the list
    pub async fn refetch(&self) {
        self.shared.refetch().await
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Release the subscription and stop background work. Idempotent.
    pub fn dispose(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.cancel.cancel();

        if let Some(subscription) = self.subscription.lock().take() {
            subscription.cancel();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        debug!("Photo feed disposed");
    }
}

impl Drop for PhotoFeed {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn listen(shared: Arc<FeedShared>, mut subscription: InsertSubscription) {
    loop {
        let event = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            event = subscription.recv() => event,
        };

        match event {
            Some(RealtimeEvent::Insert(photo)) => shared.on_insert(photo),
            Some(RealtimeEvent::Resynced) => {
                info!("Realtime channel resynced, reconciling feed");
                shared.refetch().await;
            }
            None => break,
        }
    }
    debug!("Feed listener stopped");
}

async fn reconcile(shared: Arc<FeedShared>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // first tick fires immediately; the initial fetch covers it
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = interval.tick() => shared.refetch().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{photo_at, FakeGateway};

    async fn settled(feed: &PhotoFeed) -> FeedState {
        let mut rx = feed.watch();
        let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| !s.loading))
            .await
            .expect("feed did not settle")
            .unwrap()
            .clone();
        state
    }

    async fn wait_for_count(feed: &PhotoFeed, count: usize) -> FeedState {
        let mut rx = feed.watch();
        let state = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.photos.len() == count),
        )
        .await
        .expect("feed never reached expected size")
        .unwrap()
        .clone();
        state
    }

    fn ids(state: &FeedState) -> Vec<&str> {
        state.photos.iter().map(|p| p.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_initial_fetch_replaces_list() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.seed(vec![photo_at("old", 10), photo_at("new", 20)]);

        let feed = PhotoFeed::start(gateway.clone(), FeedOptions::default()).await;
        let state = settled(&feed).await;

        assert_eq!(ids(&state), vec!["new", "old"]);
        assert_eq!(state.error, None);
        assert_eq!(gateway.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_surfaces_error_and_keeps_listening() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.set_fail_list(true);

        let feed = PhotoFeed::start(gateway.clone(), FeedOptions::default()).await;
        let state = settled(&feed).await;
        assert_eq!(state.error.as_deref(), Some(FETCH_ERROR_MESSAGE));
        assert!(state.photos.is_empty());

        gateway.emit(RealtimeEvent::Insert(photo_at("p1", 5)));
        let state = wait_for_count(&feed, 1).await;
        assert_eq!(ids(&state), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_repeated_insert_is_idempotent() {
        let gateway = Arc::new(FakeGateway::new());
        let feed = PhotoFeed::start(gateway.clone(), FeedOptions::default()).await;
        settled(&feed).await;

        for _ in 0..5 {
            gateway.emit(RealtimeEvent::Insert(photo_at("p1", 5)));
        }
        gateway.emit(RealtimeEvent::Insert(photo_at("p2", 6)));

        let state = wait_for_count(&feed, 2).await;
        assert_eq!(ids(&state), vec!["p2", "p1"]);
    }

    #[tokio::test]
    async fn test_insert_before_fetch_appears_once() {
        let gateway = Arc::new(FakeGateway::new());
        let p = photo_at("P", 100);
        gateway.seed(vec![photo_at("a", 1), p.clone()]);
        gateway.gate_list();

        let feed = PhotoFeed::start(gateway.clone(), FeedOptions::default()).await;

        gateway.emit(RealtimeEvent::Insert(p.clone()));
        let early = wait_for_count(&feed, 1).await;
        assert!(early.loading);
        assert_eq!(ids(&early), vec!["P"]);

        gateway.release_list();
        let state = settled(&feed).await;

        assert_eq!(ids(&state), vec!["P", "a"]);
        assert_eq!(state.photos.iter().filter(|x| x.id == "P").count(), 1);
    }

    #[tokio::test]
    async fn test_refetch_keeps_live_photos_missing_from_result() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.seed(vec![photo_at("a", 1)]);
        let feed = PhotoFeed::start(gateway.clone(), FeedOptions::default()).await;
        settled(&feed).await;

        // delivered live but not yet visible to list reads
        gateway.emit(RealtimeEvent::Insert(photo_at("lagging", 50)));
        wait_for_count(&feed, 2).await;

        feed.refetch().await;
        assert_eq!(ids(&feed.snapshot()), vec!["lagging", "a"]);
    }

    #[tokio::test]
    async fn test_fetch_result_is_sorted_newest_first() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.seed(vec![photo_at("b", 20), photo_at("c", 30)]);
        let feed = PhotoFeed::start(gateway.clone(), FeedOptions::default()).await;
        settled(&feed).await;

        // an older photo delivered live lands at the head until the next fetch
        gateway.emit(RealtimeEvent::Insert(photo_at("a", 10)));
        let state = wait_for_count(&feed, 3).await;
        assert_eq!(ids(&state), vec!["a", "c", "b"]);

        feed.refetch().await;
        let state = feed.snapshot();
        assert_eq!(ids(&state), vec!["c", "b", "a"]);
        assert!(state
            .photos
            .windows(2)
            .all(|w| w[0].created_at > w[1].created_at));
    }

    #[tokio::test]
    async fn test_refresh_after_live_insert_is_stable() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.seed(vec![photo_at("a", 1)]);
        let feed = PhotoFeed::start(gateway.clone(), FeedOptions::default()).await;
        settled(&feed).await;

        // a real insert: stored, then delivered
        let row = crate::model::NewPhoto::new("https://fake.storage/x.jpg", None);
        gateway.insert_photo_row(&row).await.unwrap();
        let before = wait_for_count(&feed, 2).await;

        feed.refetch().await;
        assert_eq!(feed.snapshot().photos, before.photos);
    }

    #[tokio::test]
    async fn test_resync_triggers_refetch() {
        let gateway = Arc::new(FakeGateway::new());
        let feed = PhotoFeed::start(gateway.clone(), FeedOptions::default()).await;
        settled(&feed).await;
        let calls = gateway.list_calls();

        // missed while disconnected
        gateway.seed(vec![photo_at("missed", 40)]);
        gateway.emit(RealtimeEvent::Resynced);

        let state = wait_for_count(&feed, 1).await;
        assert_eq!(ids(&state), vec!["missed"]);
        assert_eq!(gateway.list_calls(), calls + 1);
    }

    #[tokio::test]
    async fn test_periodic_reconcile() {
        let gateway = Arc::new(FakeGateway::new());
        let options = FeedOptions {
            reconcile_every: Some(Duration::from_millis(20)),
        };
        let feed = PhotoFeed::start(gateway.clone(), options).await;
        settled(&feed).await;

        gateway.seed(vec![photo_at("quiet", 7)]);
        let state = wait_for_count(&feed, 1).await;
        assert_eq!(ids(&state), vec!["quiet"]);
    }

    #[tokio::test]
    async fn test_dispose_releases_subscription_once() {
        let gateway = Arc::new(FakeGateway::new());
        let feed = PhotoFeed::start(gateway.clone(), FeedOptions::default()).await;
        assert_eq!(gateway.active_subscriptions(), 1);

        feed.dispose();
        feed.dispose();

        assert!(feed.is_disposed());
        assert_eq!(gateway.subscriptions(), 1);
        assert_eq!(gateway.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_subscription() {
        let gateway = Arc::new(FakeGateway::new());
        let feed = PhotoFeed::start(gateway.clone(), FeedOptions::default()).await;
        drop(feed);
        assert_eq!(gateway.active_subscriptions(), 0);
    }

    #[test]
    fn test_older_fetch_landing_late_is_discarded() {
        let shared = FeedShared::new(Arc::new(FakeGateway::new()));

        assert!(shared.apply_fetch(2, Ok(vec![photo_at("new", 20), photo_at("old", 10)])));
        assert!(!shared.apply_fetch(1, Ok(vec![photo_at("old", 10)])));
        assert!(!shared.apply_fetch(1, Err(StorageError::Request("late".to_string()))));

        let state = shared.state.borrow().clone();
        assert_eq!(ids(&state), vec!["new", "old"]);
        assert_eq!(state.error, None);
    }

    #[test]
    fn test_insert_seen_before_fetch_applies_survives_it() {
        let shared = FeedShared::new(Arc::new(FakeGateway::new()));
        // fetch 1 was issued, then the insert arrived before its result
        shared.on_insert(photo_at("live", 30));

        assert!(shared.apply_fetch(1, Ok(vec![photo_at("a", 1)])));
        let state = shared.state.borrow().clone();
        assert_eq!(ids(&state), vec!["live", "a"]);
        assert!(!state.loading);
    }

    #[test]
    fn test_failed_fetch_keeps_photos_and_sets_error() {
        let shared = FeedShared::new(Arc::new(FakeGateway::new()));
        assert!(shared.apply_fetch(1, Ok(vec![photo_at("a", 1)])));
        assert!(shared.apply_fetch(2, Err(StorageError::Request("down".to_string()))));

        let state = shared.state.borrow().clone();
        assert_eq!(ids(&state), vec!["a"]);
        assert_eq!(state.error.as_deref(), Some(FETCH_ERROR_MESSAGE));
    }

    #[test]
    fn test_merge_dedups_fetched_rows() {
        let merged = merge(
            vec![photo_at("a", 2), photo_at("a", 2), photo_at("b", 1)],
            &[],
            &HashSet::new(),
        );
        assert_eq!(merged.len(), 2);
    }
}
