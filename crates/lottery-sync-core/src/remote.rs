//! Remote key/value store seam
//!
//! The adapter talks to the shared store only through [`RemoteStore`].
//! Paths are flat strings; a collection path such as `events` reads as an
//! object of its children (`events/<id>`), and a watch on it fires for
//! any child change.
//!
//! [`MemoryHub`] is an in-process store shared by several clients, each
//! holding its own [`MemoryRemote`] link with an independent
//! connectivity switch. Tests and the CLI demo run on it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tracing::trace;

use crate::error::{SyncError, SyncResult};

/// Capacity of the hub's change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// A remote key/value store with change notification
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Read the value at `path` (`None` when absent)
    async fn get(&self, path: &str) -> SyncResult<Option<Value>>;

    /// Overwrite the value at `path`; writing `null` deletes it
    async fn set(&self, path: &str, value: Value) -> SyncResult<()>;

    /// Delete `path` and everything below it
    async fn remove(&self, path: &str) -> SyncResult<()>;

    /// Subscribe to changes at `path`
    ///
    /// The returned watch yields the current value first, then the new
    /// value after each change.
    async fn watch(&self, path: &str) -> SyncResult<Box<dyn RemoteWatch>>;

    /// Connectivity signal; `true` while the store is reachable
    fn connectivity(&self) -> watch::Receiver<bool>;
}

/// A push subscription on one path
#[async_trait]
pub trait RemoteWatch: Send {
    /// Next value at the watched path (`Value::Null` when absent).
    ///
    /// Returns `None` once the subscription has ended.
    async fn next(&mut self) -> Option<Value>;
}

/// Whether a write to `changed` is visible at `watched`
fn affects(watched: &str, changed: &str) -> bool {
    changed == watched
        || changed
            .strip_prefix(watched)
            .is_some_and(|rest| rest.starts_with('/'))
        || watched
            .strip_prefix(changed)
            .is_some_and(|rest| rest.starts_with('/'))
}

struct HubInner {
    data: RwLock<BTreeMap<String, Value>>,
    changes: broadcast::Sender<String>,
}

/// In-process shared store
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(HubInner {
                data: RwLock::new(BTreeMap::new()),
                changes,
            }),
        }
    }

    /// Open a new client link, initially connected
    pub fn link(&self) -> MemoryRemote {
        let (connected, _) = watch::channel(true);
        MemoryRemote {
            hub: self.clone(),
            connected: Arc::new(connected),
        }
    }

    /// Read `path` directly, regardless of any link's connectivity
    pub fn read(&self, path: &str) -> Option<Value> {
        let data = self.inner.data.read();
        if let Some(value) = data.get(path) {
            return Some(value.clone());
        }

        let prefix = format!("{}/", path);
        let mut children = Map::new();
        for (key, value) in data.range(prefix.clone()..) {
            match key.strip_prefix(&prefix) {
                Some(child) => {
                    children.insert(child.to_string(), value.clone());
                }
                None => break,
            }
        }
        if children.is_empty() {
            None
        } else {
            Some(Value::Object(children))
        }
    }

    /// Write `path` directly, regardless of any link's connectivity
    pub fn write(&self, path: &str, value: Value) {
        {
            let mut data = self.inner.data.write();
            // A write replaces the whole subtree below `path`
            let prefix = format!("{}/", path);
            data.retain(|key, _| !key.starts_with(&prefix));
            if value.is_null() {
                data.remove(path);
            } else {
                data.insert(path.to_string(), value);
            }
        }
        trace!(path, "Hub write");
        let _ = self.inner.changes.send(path.to_string());
    }

    /// Number of stored leaf entries
    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One client's link to a [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryRemote {
    hub: MemoryHub,
    connected: Arc<watch::Sender<bool>>,
}

impl MemoryRemote {
    /// Simulate the link going up or down
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }

    fn ensure_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::Connectivity("remote link is down".to_string()))
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn get(&self, path: &str) -> SyncResult<Option<Value>> {
        self.ensure_connected()?;
        Ok(self.hub.read(path))
    }

    async fn set(&self, path: &str, value: Value) -> SyncResult<()> {
        self.ensure_connected()?;
        self.hub.write(path, value);
        Ok(())
    }

    async fn remove(&self, path: &str) -> SyncResult<()> {
        self.ensure_connected()?;
        self.hub.write(path, Value::Null);
        Ok(())
    }

    async fn watch(&self, path: &str) -> SyncResult<Box<dyn RemoteWatch>> {
        self.ensure_connected()?;
        Ok(Box::new(MemoryWatch {
            hub: self.hub.clone(),
            path: path.to_string(),
            changes: self.hub.inner.changes.subscribe(),
            connected: self.connected.subscribe(),
            primed: false,
        }))
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

struct MemoryWatch {
    hub: MemoryHub,
    path: String,
    changes: broadcast::Receiver<String>,
    connected: watch::Receiver<bool>,
    primed: bool,
}

impl MemoryWatch {
    fn current(&self) -> Value {
        self.hub.read(&self.path).unwrap_or(Value::Null)
    }
}

#[async_trait]
impl RemoteWatch for MemoryWatch {
    async fn next(&mut self) -> Option<Value> {
        if !self.primed {
            self.primed = true;
            return Some(self.current());
        }

        loop {
            match self.changes.recv().await {
                Ok(changed) => {
                    if affects(&self.path, &changed) && *self.connected.borrow() {
                        return Some(self.current());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if *self.connected.borrow() {
                        return Some(self.current());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
