//! Remote store adapter
//!
//! Wraps a [`RemoteStore`] with a local [`Storage`] mirror so every read
//! and write keeps working while the remote is unreachable.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  RemoteAdapter                                                  │
//! │  ├── handle: watch<RemoteHandle>                                │
//! │  │   └── connected / local_only, observed by subscriptions      │
//! │  ├── monitor task                                               │
//! │  │   └── follows the remote connectivity signal, resyncs on     │
//! │  │       reconnect                                              │
//! │  └── subscription tasks (one per on_data_change)                │
//! │      ├── online:  push watch on the remote path, mirrored to    │
//! │      │            the cache                                     │
//! │      └── local:   fixed-interval poll of the cache              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Remote failures never propagate: they are logged and the adapter
//! degrades to the cache. `set_data` reports whether the remote write
//! landed so callers that need delivery can check.

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::remote::RemoteStore;
use crate::storage::Storage;
use crate::types::{paths, ChangeSource};

/// Connection state of one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteHandle {
    /// Remote store currently reachable
    pub connected: bool,
    /// Degraded mode: reads and notifications come from the local cache.
    ///
    /// Always `true` while disconnected; cleared only after a reconnect
    /// and a successful resync push.
    pub local_only: bool,
}

impl RemoteHandle {
    /// Online mode: connected and resynced
    pub fn is_online(&self) -> bool {
        self.connected && !self.local_only
    }
}

impl Default for RemoteHandle {
    fn default() -> Self {
        Self {
            connected: false,
            local_only: true,
        }
    }
}

/// Identifier returned by [`RemoteAdapter::on_data_change`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// Callback for data change notifications
pub type DataHandler = Arc<dyn Fn(Value, ChangeSource) + Send + Sync>;

/// Paths whose children are stored individually (`path/<child>`)
fn is_collection(path: &str) -> bool {
    path == paths::EVENTS
}

fn is_event_path(path: &str) -> bool {
    path == paths::EVENTS || path.starts_with("events/")
}

struct AdapterInner {
    remote: Arc<dyn RemoteStore>,
    cache: Storage,
    poll_interval: Duration,
    resync_paths: Vec<String>,
    handle: watch::Sender<RemoteHandle>,
    /// Paths written locally whose remote write did not land
    dirty: Mutex<BTreeSet<String>>,
    subscriptions: Mutex<HashMap<SubscriptionId, CancellationToken>>,
    next_subscription: AtomicU64,
    shutdown: CancellationToken,
}

/// Remote-backed key/value store with local cache fallback
#[derive(Clone)]
pub struct RemoteAdapter {
    inner: Arc<AdapterInner>,
}

impl RemoteAdapter {
    /// Wrap `remote` and start following its connectivity signal.
    ///
    /// If the remote is reachable now, the initial resync completes
    /// before this returns.
    pub async fn connect(remote: Arc<dyn RemoteStore>, cache: Storage, config: &SyncConfig) -> Self {
        let (handle, _) = watch::channel(RemoteHandle::default());
        let inner = Arc::new(AdapterInner {
            remote,
            cache,
            poll_interval: config.poll_interval(),
            resync_paths: config.resync_paths.clone(),
            handle,
            dirty: Mutex::new(BTreeSet::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        let mut signal = inner.remote.connectivity();
        let connected = *signal.borrow_and_update();
        if connected {
            inner.on_connected().await;
        } else {
            info!("Remote store unreachable at startup; running from local cache");
        }

        tokio::spawn(Self::monitor(inner.clone(), signal));

        Self { inner }
    }

    /// Current connection state
    pub fn handle(&self) -> RemoteHandle {
        *self.inner.handle.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.handle().connected
    }

    pub fn is_local_only(&self) -> bool {
        self.handle().local_only
    }

    /// Observe connection state transitions
    pub fn watch_handle(&self) -> watch::Receiver<RemoteHandle> {
        self.inner.handle.subscribe()
    }

    /// The local cache behind this adapter
    pub fn cache(&self) -> &Storage {
        &self.inner.cache
    }

    /// Write `value` at `path`.
    ///
    /// The local cache is written first and is never rolled back. Returns
    /// `true` only if the remote write succeeded.
    pub async fn set_data(&self, path: &str, value: Value) -> bool {
        if let Err(e) = self.inner.cache.put(path, &value) {
            error!(path, error = %e, "Failed to write local cache");
        }

        if !self.is_connected() {
            debug!(path, "Offline; write kept in local cache");
            self.inner.dirty.lock().insert(path.to_string());
            return false;
        }

        match self.inner.remote.set(path, value).await {
            Ok(()) => true,
            Err(e) => {
                warn!(path, error = %e, "Remote write failed; local cache stays authoritative");
                self.inner.dirty.lock().insert(path.to_string());
                false
            }
        }
    }

    /// Read `path`, preferring the remote store.
    ///
    /// A successful remote read refreshes the cache. Any remote failure,
    /// an absent remote value, or being disconnected falls back to the cache.
    pub async fn get_data(&self, path: &str) -> Option<Value> {
        if self.is_connected() {
            match self.inner.remote.get(path).await {
                Ok(Some(value)) => {
                    self.inner.mirror(path, &value);
                    return Some(value);
                }
                Ok(None) => debug!(path, "Remote has no value; using local cache"),
                Err(e) => warn!(path, error = %e, "Remote read failed; using local cache"),
            }
        }
        self.inner.read_cache(path)
    }

    /// Delete `path` (and its children) locally and, if connected, remotely.
    ///
    /// Returns `true` if the remote delete succeeded.
    pub async fn remove_data(&self, path: &str) -> bool {
        if let Err(e) = self.inner.cache.remove_tree(path) {
            error!(path, error = %e, "Failed to remove local cache entry");
        }
        self.inner.dirty.lock().remove(path);

        if !self.is_connected() {
            return false;
        }
        match self.inner.remote.remove(path).await {
            Ok(()) => true,
            Err(e) => {
                warn!(path, error = %e, "Remote delete failed");
                false
            }
        }
    }

    /// Read `path` from the local cache only
    pub fn get_cached(&self, path: &str) -> Option<Value> {
        self.inner.read_cache(path)
    }

    /// Write `path` to the local cache only
    ///
    /// This is how co-located collaborators (the legacy engine) share
    /// values without touching the remote store.
    pub fn set_cached(&self, path: &str, value: &Value) {
        if let Err(e) = self.inner.cache.put(path, value) {
            error!(path, error = %e, "Failed to write local cache");
        }
    }

    /// Register `handler` for changes at `path`.
    ///
    /// Online, this is a push subscription on the remote store whose values
    /// are mirrored into the cache. In local mode it polls the cache every
    /// poll interval and calls `handler` with whatever is there, changed or
    /// not. The backend follows connectivity automatically.
    pub fn on_data_change<F>(&self, path: &str, handler: F) -> SubscriptionId
    where
        F: Fn(Value, ChangeSource) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let token = self.inner.shutdown.child_token();
        self.inner.subscriptions.lock().insert(id, token.clone());

        debug!(path, subscription = %id, "Subscribing to data changes");
        tokio::spawn(Self::run_subscription(
            self.inner.clone(),
            path.to_string(),
            Arc::new(handler),
            token,
            id,
        ));
        id
    }

    /// Tear down a subscription. Unknown or already-removed ids are ignored.
    pub fn off_data_change(&self, id: SubscriptionId) {
        if let Some(token) = self.inner.subscriptions.lock().remove(&id) {
            debug!(subscription = %id, "Unsubscribing from data changes");
            token.cancel();
        }
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// Push known cached paths to the remote store now.
    ///
    /// Returns `true` if every push succeeded. Runs automatically on each
    /// reconnect.
    pub async fn resync(&self) -> bool {
        self.inner.resync().await
    }

    /// Stop the connectivity monitor and every subscription
    pub fn shutdown(&self) {
        info!("Shutting down remote adapter");
        self.inner.subscriptions.lock().clear();
        self.inner.shutdown.cancel();
    }

    /// Follow the remote connectivity signal
    async fn monitor(inner: Arc<AdapterInner>, mut signal: watch::Receiver<bool>) {
        let mut retry = tokio::time::interval(inner.poll_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let needs_resync = {
                let handle = inner.handle.borrow();
                handle.connected && handle.local_only
            };

            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                changed = signal.changed() => {
                    if changed.is_err() {
                        warn!("Connectivity signal closed; staying in local mode");
                        inner.on_disconnected();
                        break;
                    }
                    let connected = *signal.borrow_and_update();
                    if connected {
                        inner.on_connected().await;
                    } else {
                        inner.on_disconnected();
                    }
                }
                _ = retry.tick(), if needs_resync => {
                    debug!("Retrying resync");
                    inner.on_connected().await;
                }
            }
        }
        debug!("Connectivity monitor ended");
    }

    async fn run_subscription(
        inner: Arc<AdapterInner>,
        path: String,
        handler: DataHandler,
        token: CancellationToken,
        id: SubscriptionId,
    ) {
        let mut handle_rx = inner.handle.subscribe();

        'backend: loop {
            let online = handle_rx.borrow_and_update().is_online();
            let backend = Self::drive(inner.clone(), path.clone(), handler.clone(), online);
            tokio::pin!(backend);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break 'backend,
                    changed = handle_rx.changed() => {
                        if changed.is_err() {
                            break 'backend;
                        }
                        if handle_rx.borrow_and_update().is_online() != online {
                            debug!(path = %path, subscription = %id, online = !online, "Switching subscription backend");
                            continue 'backend;
                        }
                    }
                    _ = &mut backend => break 'backend,
                }
            }
        }
        debug!(path = %path, subscription = %id, "Subscription ended");
    }

    /// Deliver changes from the push or poll backend
    async fn drive(inner: Arc<AdapterInner>, path: String, handler: DataHandler, online: bool) {
        if online {
            match inner.remote.watch(&path).await {
                Ok(mut watch) => {
                    while let Some(value) = watch.next().await {
                        inner.mirror(&path, &value);
                        invoke(&handler, &path, value, ChangeSource::Remote);
                    }
                    warn!(path = %path, "Remote watch ended; polling local cache");
                }
                Err(e) => warn!(path = %path, error = %e, "Remote watch failed; polling local cache"),
            }
        }

        let mut ticker = tokio::time::interval(inner.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(value) = inner.read_cache(&path) {
                invoke(&handler, &path, value, ChangeSource::Local);
            }
        }
    }
}

/// Call a data handler, isolating panics
fn invoke(handler: &DataHandler, path: &str, value: Value, source: ChangeSource) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(value, source)));
    if result.is_err() {
        error!(path, ?source, "Data change handler panicked");
    }
}

impl AdapterInner {
    async fn on_connected(&self) {
        let current = *self.handle.borrow();
        if current.is_online() {
            return;
        }
        if !current.connected {
            info!("Remote store connected; resyncing local cache");
            self.handle.send_replace(RemoteHandle {
                connected: true,
                local_only: true,
            });
        }

        if self.resync().await {
            // The link may have dropped while we were pushing
            if self.handle.borrow().connected {
                info!("Resync complete; leaving local mode");
                self.handle.send_replace(RemoteHandle {
                    connected: true,
                    local_only: false,
                });
            }
        } else {
            warn!("Resync incomplete; staying in local mode");
        }
    }

    fn on_disconnected(&self) {
        if self.handle.borrow().connected {
            warn!("Remote store disconnected; falling back to local cache");
        }
        self.handle.send_replace(RemoteHandle::default());
    }

    /// Push known and dirty cached paths, overwriting the remote values
    async fn resync(&self) -> bool {
        let mut targets: BTreeSet<String> = self.resync_paths.iter().cloned().collect();
        // Events written offline are not replayed; they would be stale on arrival
        targets.extend(
            self.dirty
                .lock()
                .iter()
                .filter(|p| !is_event_path(p))
                .cloned(),
        );

        let mut complete = true;
        let mut pushed = 0usize;
        for path in &targets {
            let value = match self.cache.get(path) {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    warn!(path = %path, error = %e, "Unreadable cache entry skipped during resync");
                    continue;
                }
            };
            match self.remote.set(path, value).await {
                Ok(()) => {
                    pushed += 1;
                    self.dirty.lock().remove(path);
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Resync push failed");
                    complete = false;
                }
            }
        }

        if complete {
            self.dirty.lock().retain(|p| !is_event_path(p));
        }
        debug!(pushed, complete, "Resync finished");
        complete
    }

    /// Mirror a remote value into the cache; absent remote values are ignored
    fn mirror(&self, path: &str, value: &Value) {
        if value.is_null() {
            return;
        }

        let result = match (is_collection(path), value.as_object()) {
            (true, Some(children)) => self.cache.remove_tree(path).and_then(|_| {
                for (child, child_value) in children {
                    self.cache.put(&format!("{}/{}", path, child), child_value)?;
                }
                Ok(())
            }),
            _ => self.cache.put(path, value),
        };
        if let Err(e) = result {
            error!(path, error = %e, "Failed to mirror remote value into cache");
        }
    }

    fn read_cache(&self, path: &str) -> Option<Value> {
        let result = if is_collection(path) {
            self.cache.get_collection(path)
        } else {
            self.cache.get(path)
        };
        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(path, error = %e, "Unreadable cache entry treated as absent");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryHub;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> SyncConfig {
        SyncConfig {
            poll_interval_ms: 20,
            ..Default::default()
        }
    }

    async fn adapter_on(hub: &MemoryHub) -> (RemoteAdapter, crate::remote::MemoryRemote) {
        let link = hub.link();
        let adapter = RemoteAdapter::connect(
            Arc::new(link.clone()),
            Storage::in_memory().unwrap(),
            &test_config(),
        )
        .await;
        (adapter, link)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    /// Remote whose writes can be made to fail while the link stays up
    struct FlakyRemote {
        link: crate::remote::MemoryRemote,
        failing: std::sync::atomic::AtomicBool,
        set_attempts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RemoteStore for FlakyRemote {
        async fn get(&self, path: &str) -> crate::error::SyncResult<Option<Value>> {
            self.link.get(path).await
        }

        async fn set(&self, path: &str, value: Value) -> crate::error::SyncResult<()> {
            self.set_attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(crate::error::SyncError::Connectivity("write rejected".into()));
            }
            self.link.set(path, value).await
        }

        async fn remove(&self, path: &str) -> crate::error::SyncResult<()> {
            self.link.remove(path).await
        }

        async fn watch(
            &self,
            path: &str,
        ) -> crate::error::SyncResult<Box<dyn crate::remote::RemoteWatch>> {
            self.link.watch(path).await
        }

        fn connectivity(&self) -> watch::Receiver<bool> {
            self.link.connectivity()
        }
    }

    #[tokio::test]
    async fn test_local_mode_held_until_resync_push_succeeds() {
        let hub = MemoryHub::new();
        let link = hub.link();
        let remote = Arc::new(FlakyRemote {
            link: link.clone(),
            failing: std::sync::atomic::AtomicBool::new(false),
            set_attempts: AtomicUsize::new(0),
        });
        let adapter = RemoteAdapter::connect(
            remote.clone(),
            Storage::in_memory().unwrap(),
            &test_config(),
        )
        .await;
        assert!(adapter.handle().is_online());

        link.set_connected(false);
        assert!(wait_until(|| !adapter.is_connected()).await);
        assert!(!adapter.set_data("prizes", json!(["bicycle"])).await);

        remote.failing.store(true, Ordering::SeqCst);
        let before = remote.set_attempts.load(Ordering::SeqCst);
        link.set_connected(true);

        // Several failed pushes, retried on the poll interval
        assert!(wait_until(|| remote.set_attempts.load(Ordering::SeqCst) >= before + 3).await);
        assert_eq!(
            adapter.handle(),
            RemoteHandle {
                connected: true,
                local_only: true
            }
        );
        assert!(!adapter.handle().is_online());
        assert_eq!(hub.read("prizes"), None);

        remote.failing.store(false, Ordering::SeqCst);
        assert!(wait_until(|| adapter.handle().is_online()).await);
        assert_eq!(hub.read("prizes"), Some(json!(["bicycle"])));
    }

    #[tokio::test]
    async fn test_connected_at_startup_is_online() {
        let hub = MemoryHub::new();
        let (adapter, _link) = adapter_on(&hub).await;
        assert_eq!(
            adapter.handle(),
            RemoteHandle {
                connected: true,
                local_only: false
            }
        );
    }

    #[tokio::test]
    async fn test_set_then_get_round_trips() {
        let hub = MemoryHub::new();
        let (adapter, _link) = adapter_on(&hub).await;

        assert!(adapter.set_data("prizes", json!([{"id": "p1"}])).await);
        assert_eq!(adapter.get_data("prizes").await, Some(json!([{"id": "p1"}])));
        assert_eq!(hub.read("prizes"), Some(json!([{"id": "p1"}])));
        assert_eq!(adapter.get_cached("prizes"), Some(json!([{"id": "p1"}])));
    }

    #[tokio::test]
    async fn test_offline_write_is_cached_and_reports_false() {
        let hub = MemoryHub::new();
        let (adapter, link) = adapter_on(&hub).await;

        link.set_connected(false);
        assert!(wait_until(|| !adapter.is_connected()).await);
        assert!(adapter.is_local_only());

        assert!(!adapter.set_data("winners", json!(["ada"])).await);
        assert_eq!(adapter.get_data("winners").await, Some(json!(["ada"])));
        assert_eq!(hub.read("winners"), None);
    }

    #[tokio::test]
    async fn test_remote_read_refreshes_cache() {
        let hub = MemoryHub::new();
        let (adapter, _link) = adapter_on(&hub).await;

        hub.write("employees", json!(["grace"]));
        assert_eq!(adapter.get_cached("employees"), None);
        assert_eq!(adapter.get_data("employees").await, Some(json!(["grace"])));
        assert_eq!(adapter.get_cached("employees"), Some(json!(["grace"])));
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let hub = MemoryHub::new();
        let (adapter, _link) = adapter_on(&hub).await;
        assert_eq!(adapter.get_data("bonusSettings").await, None);
    }

    #[tokio::test]
    async fn test_reconnect_resync_pushes_offline_edits() {
        let hub = MemoryHub::new();
        let (adapter, link) = adapter_on(&hub).await;

        adapter.set_data("lotteryState", json!({"status": "waiting"})).await;

        link.set_connected(false);
        assert!(wait_until(|| !adapter.is_connected()).await);
        adapter
            .set_data("lotteryState", json!({"status": "rolling"}))
            .await;
        // Someone else writes meanwhile
        hub.write("lotteryState", json!({"status": "finished"}));

        link.set_connected(true);
        assert!(wait_until(|| adapter.handle().is_online()).await);
        assert_eq!(hub.read("lotteryState"), Some(json!({"status": "rolling"})));
    }

    #[tokio::test]
    async fn test_push_subscription_delivers_and_mirrors() {
        let hub = MemoryHub::new();
        let (adapter, _link) = adapter_on(&hub).await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        adapter.on_data_change("prizes", move |value, source| {
            seen_clone.lock().push((value, source));
        });

        hub.write("prizes", json!(["tv"]));
        assert!(
            wait_until(|| seen
                .lock()
                .iter()
                .any(|(v, s)| *v == json!(["tv"]) && *s == ChangeSource::Remote))
            .await
        );
        assert_eq!(adapter.get_cached("prizes"), Some(json!(["tv"])));
    }

    #[tokio::test]
    async fn test_offline_subscription_polls_cache_repeatedly() {
        let hub = MemoryHub::new();
        let link = hub.link();
        link.set_connected(false);
        let adapter = RemoteAdapter::connect(
            Arc::new(link.clone()),
            Storage::in_memory().unwrap(),
            &test_config(),
        )
        .await;
        assert!(adapter.is_local_only());

        adapter.set_cached("prizes", &json!(["bike"]));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        adapter.on_data_change("prizes", move |value, source| {
            assert_eq!(value, json!(["bike"]));
            assert_eq!(source, ChangeSource::Local);
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Unchanged values are still delivered on every tick
        assert!(wait_until(|| calls.load(Ordering::SeqCst) >= 3).await);
    }

    #[tokio::test]
    async fn test_subscription_switches_to_push_after_reconnect() {
        let hub = MemoryHub::new();
        let link = hub.link();
        link.set_connected(false);
        let adapter = RemoteAdapter::connect(
            Arc::new(link.clone()),
            Storage::in_memory().unwrap(),
            &test_config(),
        )
        .await;

        let remote_seen = Arc::new(AtomicUsize::new(0));
        let counter = remote_seen.clone();
        adapter.on_data_change("winners", move |value, source| {
            if source == ChangeSource::Remote && value == json!(["lin"]) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        link.set_connected(true);
        assert!(wait_until(|| adapter.handle().is_online()).await);
        hub.write("winners", json!(["lin"]));
        assert!(wait_until(|| remote_seen.load(Ordering::SeqCst) >= 1).await);
    }

    #[tokio::test]
    async fn test_off_data_change_is_idempotent() {
        let hub = MemoryHub::new();
        let (adapter, _link) = adapter_on(&hub).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let id = adapter.on_data_change("prizes", move |_, _| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(adapter.subscription_count(), 1);

        adapter.off_data_change(id);
        adapter.off_data_change(id);
        assert_eq!(adapter.subscription_count(), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let before = calls.load(Ordering::SeqCst);
        hub.write("prizes", json!(["late"]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_kill_subscription() {
        let hub = MemoryHub::new();
        let (adapter, _link) = adapter_on(&hub).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        adapter.on_data_change("prizes", move |_, _| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            panic!("handler bug");
        });

        hub.write("prizes", json!([1]));
        hub.write("prizes", json!([2]));
        assert!(wait_until(|| calls.load(Ordering::SeqCst) >= 2).await);
    }

    #[tokio::test]
    async fn test_collection_mirror_and_remove() {
        let hub = MemoryHub::new();
        let (adapter, _link) = adapter_on(&hub).await;

        adapter.set_data("events/a", json!({"id": "a"})).await;
        hub.write("events/b", json!({"id": "b"}));

        let events = adapter.get_data("events").await.unwrap();
        assert_eq!(events.as_object().unwrap().len(), 2);
        assert_eq!(
            adapter.get_cached("events"),
            Some(json!({"a": {"id": "a"}, "b": {"id": "b"}}))
        );

        assert!(adapter.remove_data("events/a").await);
        assert_eq!(hub.read("events"), Some(json!({"b": {"id": "b"}})));
        assert_eq!(adapter.get_cached("events"), Some(json!({"b": {"id": "b"}})));
    }

    #[tokio::test]
    async fn test_shutdown_releases_subscriptions() {
        let hub = MemoryHub::new();
        let (adapter, _link) = adapter_on(&hub).await;

        adapter.on_data_change("prizes", |_, _| {});
        adapter.on_data_change("winners", |_, _| {});
        assert_eq!(adapter.subscription_count(), 2);

        adapter.shutdown();
        assert_eq!(adapter.subscription_count(), 0);
    }
}
