//! LotteryClient - the entry point used by UI code
//!
//! Wires the adapter, event bus, reconciler and command bridge together
//! for one client process:
//!
//! - `Admin` manages prizes, employees and settings, and may own an engine
//! - `Controller` only issues commands; it has no local execution path
//! - `Display` owns the legacy engine and executes commands it receives
//!
//! # Example
//!
//! ```ignore
//! use lottery_sync_core::{ClientRole, LotteryClient, MemoryHub, Storage, SyncConfig};
//!
//! let hub = MemoryHub::new();
//! let controller = LotteryClient::connect(
//!     Arc::new(hub.link()),
//!     Storage::in_memory()?,
//!     SyncConfig::default(),
//!     ClientRole::Controller,
//!     None,
//! )
//! .await?;
//!
//! controller.start_lottery(Some(PrizeRef::new("p1", "Bicycle"))).await?;
//! ```

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStore;
use crate::storage::Storage;
use crate::sync::{
    CommandBridge, Delivery, EventBus, HandlerId, HandlerResult, LegacyEngine, RemoteAdapter,
    RemoteHandle, StateReconciler,
};
use crate::types::{paths, ClientId, Event, EventType, LotteryState, PrizeRef};

/// What a client process is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Admin,
    Controller,
    Display,
}

impl std::fmt::Display for ClientRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientRole::Admin => f.write_str("admin"),
            ClientRole::Controller => f.write_str("controller"),
            ClientRole::Display => f.write_str("display"),
        }
    }
}

impl std::str::FromStr for ClientRole {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(ClientRole::Admin),
            "controller" => Ok(ClientRole::Controller),
            "display" => Ok(ClientRole::Display),
            other => Err(SyncError::Config(format!("unknown client role: {}", other))),
        }
    }
}

/// Callback for connectivity transitions: `(is_connected, local_mode)`
pub type ConnectionListener = Arc<dyn Fn(bool, bool) + Send + Sync>;

/// Snapshot of a client for display purposes
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub role: ClientRole,
    pub connected: bool,
    pub local_only: bool,
    pub state: LotteryState,
}

struct ClientInner {
    role: ClientRole,
    adapter: RemoteAdapter,
    bus: EventBus,
    reconciler: StateReconciler,
    bridge: CommandBridge,
    connection_listeners: RwLock<Vec<ConnectionListener>>,
    shutdown: CancellationToken,
}

/// One connected lottery client
#[derive(Clone)]
pub struct LotteryClient {
    inner: Arc<ClientInner>,
}

impl LotteryClient {
    /// Connect a client to `remote`, using `storage` as its local cache.
    ///
    /// A `Display` client must be given the legacy engine; a `Controller`
    /// must not.
    pub async fn connect(
        remote: Arc<dyn RemoteStore>,
        storage: Storage,
        config: SyncConfig,
        role: ClientRole,
        engine: Option<Arc<dyn LegacyEngine>>,
    ) -> SyncResult<Self> {
        config.validate()?;
        match (role, engine.is_some()) {
            (ClientRole::Display, false) => {
                return Err(SyncError::Config(
                    "display clients need a legacy engine".to_string(),
                ))
            }
            (ClientRole::Controller, true) => {
                return Err(SyncError::Config(
                    "controller clients cannot own a legacy engine".to_string(),
                ))
            }
            _ => {}
        }

        let adapter = RemoteAdapter::connect(remote, storage, &config).await;
        let client_id = ClientId::new();
        let bus = EventBus::new(adapter.clone(), client_id, &config);
        let reconciler = StateReconciler::new(adapter.clone(), bus.clone()).await;
        let bridge = CommandBridge::new(bus.clone(), engine);
        if bridge.has_engine() {
            bridge.spawn_poll(config.command_poll_interval());
            reconciler.spawn_cache_poll(config.command_poll_interval());
        }

        let inner = Arc::new(ClientInner {
            role,
            adapter,
            bus,
            reconciler,
            bridge,
            connection_listeners: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });

        let handle_rx = inner.adapter.watch_handle();
        tokio::spawn(Self::follow_connection(
            Arc::downgrade(&inner),
            handle_rx,
            inner.shutdown.clone(),
        ));

        inner
            .bus
            .broadcast_event(EventType::SystemReady, json!({ "role": role }))
            .await;
        info!(client = %client_id, role = %role, "Lottery client ready");

        Ok(Self { inner })
    }

    /// Publish `CONNECTION_STATUS` and notify listeners on every transition
    async fn follow_connection(
        inner: Weak<ClientInner>,
        mut handle_rx: watch::Receiver<RemoteHandle>,
        shutdown: CancellationToken,
    ) {
        let mut last = *handle_rx.borrow_and_update();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = handle_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let handle = *handle_rx.borrow_and_update();
            if handle == last {
                continue;
            }
            last = handle;

            let Some(inner) = inner.upgrade() else {
                break;
            };
            debug!(
                connected = handle.connected,
                local_only = handle.local_only,
                "Connection state changed"
            );

            let listeners: Vec<ConnectionListener> = inner.connection_listeners.read().clone();
            for listener in listeners {
                listener(handle.connected, handle.local_only);
            }

            inner
                .bus
                .broadcast_event(
                    EventType::ConnectionStatus,
                    json!({
                        "isConnected": handle.connected,
                        "localMode": handle.local_only,
                    }),
                )
                .await;
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.inner.bus.client_id()
    }

    pub fn role(&self) -> ClientRole {
        self.inner.role
    }

    pub fn info(&self) -> ClientInfo {
        let handle = self.inner.adapter.handle();
        ClientInfo {
            client_id: self.client_id(),
            role: self.inner.role,
            connected: handle.connected,
            local_only: handle.local_only,
            state: self.state(),
        }
    }

    pub fn adapter(&self) -> &RemoteAdapter {
        &self.inner.adapter
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn reconciler(&self) -> &StateReconciler {
        &self.inner.reconciler
    }

    pub fn bridge(&self) -> &CommandBridge {
        &self.inner.bridge
    }

    /// Copy of the canonical lottery state
    pub fn state(&self) -> LotteryState {
        self.inner.reconciler.state()
    }

    pub fn on_state_changed<F>(&self, listener: F)
    where
        F: Fn(&LotteryState) + Send + Sync + 'static,
    {
        self.inner.reconciler.on_state_changed(listener);
    }

    pub fn on_connection_change<F>(&self, listener: F)
    where
        F: Fn(bool, bool) + Send + Sync + 'static,
    {
        self.inner
            .connection_listeners
            .write()
            .push(Arc::new(listener));
    }

    pub async fn broadcast_event(&self, event_type: EventType, payload: Value) -> bool {
        self.inner.bus.broadcast_event(event_type, payload).await
    }

    pub fn on_event<F>(&self, event_type: EventType, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.bus.on(event_type, handler)
    }

    pub fn off_event(&self, event_type: EventType, id: HandlerId) -> bool {
        self.inner.bus.off(event_type, id)
    }

    pub async fn start_lottery(&self, prize: Option<PrizeRef>) -> SyncResult<Delivery> {
        self.inner.bridge.start_lottery(prize).await
    }

    pub async fn stop_lottery(&self) -> SyncResult<Delivery> {
        self.inner.bridge.stop_lottery().await
    }

    pub async fn reset_lottery(&self) -> SyncResult<Delivery> {
        self.inner.bridge.reset_lottery().await
    }

    /// Replace the prize catalogue and announce it
    pub async fn update_prizes(&self, prizes: Value) -> bool {
        self.write_and_announce(paths::PRIZES, prizes, Some(EventType::PrizesUpdated))
            .await
    }

    /// Replace the employee list and announce it
    pub async fn update_employees(&self, employees: Value) -> bool {
        self.write_and_announce(paths::EMPLOYEES, employees, Some(EventType::EmployeesUpdated))
            .await
    }

    pub async fn update_bonus_settings(&self, settings: Value) -> bool {
        self.write_and_announce(paths::BONUS_SETTINGS, settings, None)
            .await
    }

    /// Publish the outcome of a draw
    pub async fn announce_result(&self, result: Value) -> bool {
        self.inner
            .bus
            .broadcast_event(EventType::LotteryResult, result)
            .await
    }

    async fn write_and_announce(&self, path: &str, value: Value, announce: Option<EventType>) -> bool {
        let stored = self.inner.adapter.set_data(path, value.clone()).await;
        if !stored {
            warn!(path, "Update kept locally until the remote store is reachable");
        }

        match announce {
            Some(event_type) => {
                let mut payload = serde_json::Map::new();
                payload.insert(path.to_string(), value);
                let announced = self
                    .inner
                    .bus
                    .broadcast_event(event_type, Value::Object(payload))
                    .await;
                stored && announced
            }
            None => stored,
        }
    }

    /// Stop background work and drop every subscription
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.bridge.cleanup();
        self.inner.reconciler.cleanup();
        self.inner.bus.cleanup();
        self.inner.adapter.shutdown();
        info!(client = %self.client_id(), "Lottery client shut down");
    }
}
