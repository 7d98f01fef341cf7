//! Event bus over the shared `events` collection
//!
//! Publishing writes one [`Event`] at `events/<id>` through the
//! [`RemoteAdapter`]. Every client holds a single subscription on the whole
//! collection and, on each notification, reduces it to the newest event:
//!
//! - already dispatched (same id as last time) → ignored
//! - older than the freshness window → ignored
//! - otherwise → handlers for its type run in registration order
//!
//! Delivery is best effort. When several events land between two
//! notifications only the newest is seen; the others are dropped. Handlers
//! must tolerate redelivery after a resubscribe and must tolerate seeing
//! events this client published itself (see [`Event::origin_for`]).

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::adapter::{RemoteAdapter, SubscriptionId};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::types::{now_ms, paths, payload_map, ClientId, Event, EventId, EventType, Stamp};

/// Result returned by event handlers
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Callback for bus events
pub type EventHandler = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;

/// Identifier returned by [`EventBus::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct BusInner {
    adapter: RemoteAdapter,
    client: ClientId,
    freshness_window_ms: i64,
    prune_stale_events: bool,
    /// Publish counter for [`Stamp`]s
    counter: AtomicU64,
    next_handler: AtomicU64,
    handlers: RwLock<HashMap<EventType, Vec<(HandlerId, EventHandler)>>>,
    last_dispatched: Mutex<Option<EventId>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

/// Typed, timestamped, deduplicated event bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create the bus and subscribe to the shared events collection.
    ///
    /// Call after the adapter is connected; one bus per client process.
    pub fn new(adapter: RemoteAdapter, client: ClientId, config: &SyncConfig) -> Self {
        let inner = Arc::new(BusInner {
            adapter,
            client,
            freshness_window_ms: config.freshness_window_ms(),
            prune_stale_events: config.prune_stale_events,
            counter: AtomicU64::new(0),
            next_handler: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
            last_dispatched: Mutex::new(None),
            subscription: Mutex::new(None),
        });

        let weak: Weak<BusInner> = Arc::downgrade(&inner);
        let id = inner.adapter.on_data_change(paths::EVENTS, move |value, _source| {
            if let Some(inner) = weak.upgrade() {
                inner.on_collection(value);
            }
        });
        *inner.subscription.lock() = Some(id);

        Self { inner }
    }

    pub fn client_id(&self) -> ClientId {
        self.inner.client
    }

    pub fn adapter(&self) -> &RemoteAdapter {
        &self.inner.adapter
    }

    /// Allocate the next publish stamp for this client
    pub fn next_stamp(&self) -> Stamp {
        Stamp {
            client: self.inner.client,
            counter: self.inner.counter.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// Publish a new event of `event_type`.
    ///
    /// Returns `true` if the event reached the remote store. Offline
    /// events stay in the local cache, where this client's own polling
    /// subscription still sees them.
    pub async fn broadcast_event(&self, event_type: EventType, payload: Value) -> bool {
        let event = Event::new(event_type, payload_map(payload)).with_origin(self.next_stamp());
        self.publish(event).await
    }

    /// Publish a fully built event
    pub async fn publish(&self, event: Event) -> bool {
        let value = match serde_json::to_value(&event) {
            Ok(value) => value,
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "Failed to encode event");
                return false;
            }
        };

        let delivered = self.inner.adapter.set_data(&event.path(), value).await;
        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            delivered,
            "Published event"
        );

        if self.inner.prune_stale_events {
            self.prune_stale().await;
        }
        delivered
    }

    /// Register `handler` for `event_type`; handlers run in registration order
    pub fn on<F>(&self, event_type: EventType, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn off(&self, event_type: EventType, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write();
        let Some(list) = handlers.get_mut(&event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&event_type);
        }
        removed
    }

    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.inner
            .handlers
            .read()
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Id of the last dispatched event, if any
    pub fn last_dispatched(&self) -> Option<EventId> {
        self.inner.last_dispatched.lock().clone()
    }

    /// Drop the collection subscription and every handler
    pub fn cleanup(&self) {
        if let Some(id) = self.inner.subscription.lock().take() {
            self.inner.adapter.off_data_change(id);
        }
        self.inner.handlers.write().clear();
        debug!("Event bus cleaned up");
    }

    /// Remove events older than the freshness window from the collection
    async fn prune_stale(&self) {
        let Some(Value::Object(entries)) = self.inner.adapter.get_data(paths::EVENTS).await else {
            return;
        };

        let now = now_ms();
        let stale: BTreeSet<String> = entries
            .into_iter()
            .filter_map(|(id, raw)| {
                let event: Event = serde_json::from_value(raw).ok()?;
                (!event.is_fresh(now, self.inner.freshness_window_ms)).then_some(id)
            })
            .collect();

        for id in &stale {
            self.inner.adapter.remove_data(&paths::event(id)).await;
        }
        if !stale.is_empty() {
            debug!(pruned = stale.len(), "Pruned stale events");
        }
    }
}

impl BusInner {
    /// Handle one notification of the whole events collection
    fn on_collection(&self, value: Value) {
        let Value::Object(entries) = value else {
            return;
        };

        let latest = entries
            .into_iter()
            .filter_map(|(key, raw)| match serde_json::from_value::<Event>(raw) {
                Ok(event) => Some(event),
                Err(e) => {
                    let err = SyncError::Serialization(e.to_string());
                    trace!(key = %key, error = %err, "Skipping malformed event");
                    None
                }
            })
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        if let Some(event) = latest {
            if self.accept(&event, now_ms()) {
                self.dispatch(&event);
            }
        }
    }

    /// Dedupe and freshness gate
    fn accept(&self, event: &Event, now: i64) -> bool {
        let mut last = self.last_dispatched.lock();
        if last.as_ref() == Some(&event.id) {
            return false;
        }
        if !event.is_fresh(now, self.freshness_window_ms) {
            let err = SyncError::StaleEvent {
                id: event.id.to_string(),
                age_ms: event.age_ms(now),
            };
            trace!(error = %err, "Dropping event");
            return false;
        }
        *last = Some(event.id.clone());
        true
    }

    fn dispatch(&self, event: &Event) {
        let handlers: Vec<(HandlerId, EventHandler)> = self
            .handlers
            .read()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            handlers = handlers.len(),
            "Dispatching event"
        );

        for (id, handler) in handlers {
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let err = SyncError::Handler(e.to_string());
                    warn!(event_id = %event.id, handler = ?id, error = %err, "Event handler failed");
                }
                Err(_) => {
                    warn!(event_id = %event.id, handler = ?id, "Event handler panicked");
                }
            }
        }
    }
}
