//! Command bridge between the event bus and the legacy lottery engine
//!
//! Outbound, start/stop/reset intents become `START_LOTTERY`,
//! `STOP_LOTTERY` and `RESET_LOTTERY` events. Inbound, on a client that
//! owns a [`LegacyEngine`], the same events drive the engine hooks.
//!
//! Echo suppression uses origins instead of timers:
//!
//! - commands stamped by this client are never re-executed when the bus
//!   reflects them back
//! - while a remote command executes, an [`ExecutionScope`] is held;
//!   commands raised from inside the hooks are not re-broadcast, and
//!   command records written meanwhile are tagged [`Origin::Remote`]
//! - the poll-and-diff fallback over the local `lotteryCommand` record
//!   only propagates records tagged [`Origin::Local`]

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::adapter::RemoteAdapter;
use super::bus::{EventBus, HandlerId, HandlerResult};
use crate::error::{SyncError, SyncResult};
use crate::types::{now_ms, paths, Event, EventType, Origin, PrizeRef};

/// Hooks into the legacy in-process lottery engine
pub trait LegacyEngine: Send + Sync {
    fn start(&self, prize: Option<&PrizeRef>);
    fn stop(&self);
    fn reset(&self);
}

/// A domain command issued by a controlling client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum LotteryCommand {
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prize: Option<PrizeRef>,
    },
    Stop,
    Reset,
}

impl LotteryCommand {
    pub fn event_type(&self) -> EventType {
        match self {
            LotteryCommand::Start { .. } => EventType::StartLottery,
            LotteryCommand::Stop => EventType::StopLottery,
            LotteryCommand::Reset => EventType::ResetLottery,
        }
    }

    pub fn payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        if let LotteryCommand::Start { prize: Some(prize) } = self {
            if let Ok(value) = serde_json::to_value(prize) {
                payload.insert("prize".to_string(), value);
            }
        }
        payload
    }

    /// Decode a command event
    pub fn from_event(event: &Event) -> SyncResult<Self> {
        match event.event_type {
            EventType::StartLottery => {
                let prize = match event.payload.get("prize") {
                    None | Some(Value::Null) => None,
                    Some(value) => Some(serde_json::from_value(value.clone())?),
                };
                Ok(LotteryCommand::Start { prize })
            }
            EventType::StopLottery => Ok(LotteryCommand::Stop),
            EventType::ResetLottery => Ok(LotteryCommand::Reset),
            other => Err(SyncError::Serialization(format!(
                "{} is not a lottery command",
                other
            ))),
        }
    }
}

impl std::fmt::Display for LotteryCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LotteryCommand::Start { .. } => f.write_str("start"),
            LotteryCommand::Stop => f.write_str("stop"),
            LotteryCommand::Reset => f.write_str("reset"),
        }
    }
}

/// The local command record shared with the legacy engine at `lotteryCommand`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command: LotteryCommand,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub issued_at: i64,
}

/// Outcome of [`CommandBridge::issue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Reached the remote store
    Delivered,
    /// Executed locally; the remote store was unreachable
    LocalOnly,
    /// Raised while executing a remote command; not re-broadcast
    Suppressed,
}

/// Marks the bridge as executing a remote command for its lifetime
struct ExecutionScope<'a>(&'a AtomicUsize);

impl<'a> ExecutionScope<'a> {
    fn enter(depth: &'a AtomicUsize) -> Self {
        depth.fetch_add(1, Ordering::SeqCst);
        Self(depth)
    }
}

impl Drop for ExecutionScope<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct BridgeInner {
    bus: EventBus,
    adapter: RemoteAdapter,
    engine: Option<Arc<dyn LegacyEngine>>,
    executing: AtomicUsize,
    local_counter: AtomicU64,
    /// Serialized command record last observed by the poll fallback
    last_seen: Mutex<Option<String>>,
    handlers: Mutex<Vec<(EventType, HandlerId)>>,
    poll: Mutex<Option<CancellationToken>>,
}

#[derive(Clone)]
pub struct CommandBridge {
    inner: Arc<BridgeInner>,
}

impl CommandBridge {
    /// Create the bridge. With an engine, inbound command events execute on it.
    pub fn new(bus: EventBus, engine: Option<Arc<dyn LegacyEngine>>) -> Self {
        let adapter = bus.adapter().clone();
        let inner = Arc::new(BridgeInner {
            bus,
            adapter,
            engine,
            executing: AtomicUsize::new(0),
            local_counter: AtomicU64::new(0),
            last_seen: Mutex::new(None),
            handlers: Mutex::new(Vec::new()),
            poll: Mutex::new(None),
        });

        if inner.engine.is_some() {
            let mut handlers = inner.handlers.lock();
            for event_type in [
                EventType::StartLottery,
                EventType::StopLottery,
                EventType::ResetLottery,
            ] {
                let weak: Weak<BridgeInner> = Arc::downgrade(&inner);
                let id = inner.bus.on(event_type, move |event| match weak.upgrade() {
                    Some(inner) => inner.on_command_event(event),
                    None => Ok(()),
                });
                handlers.push((event_type, id));
            }
        }

        Self { inner }
    }

    /// Whether this client can execute commands itself
    pub fn has_engine(&self) -> bool {
        self.inner.engine.is_some()
    }

    /// Whether a remote command is executing right now
    pub fn is_executing(&self) -> bool {
        self.inner.in_scope()
    }

    pub async fn start_lottery(&self, prize: Option<PrizeRef>) -> SyncResult<Delivery> {
        self.issue(LotteryCommand::Start { prize }).await
    }

    pub async fn stop_lottery(&self) -> SyncResult<Delivery> {
        self.issue(LotteryCommand::Stop).await
    }

    pub async fn reset_lottery(&self) -> SyncResult<Delivery> {
        self.issue(LotteryCommand::Reset).await
    }

    /// Issue a command from this client.
    ///
    /// With an engine, the command runs locally first and is then
    /// broadcast. Without one (a pure controller) the broadcast is the
    /// only path, so an unreachable remote store is an error the operator
    /// must see: `SyncError::CommandUndeliverable`.
    pub async fn issue(&self, command: LotteryCommand) -> SyncResult<Delivery> {
        let inner = &self.inner;
        if inner.in_scope() {
            debug!(command = %command, "Command raised while executing a remote command; not re-broadcast");
            return Ok(Delivery::Suppressed);
        }

        match &inner.engine {
            Some(engine) => {
                let origin = Origin::Local(inner.next_local());
                inner.execute(engine.as_ref(), &command, origin);
            }
            None if !inner.adapter.is_connected() => {
                return Err(inner.undeliverable(&command));
            }
            None => {}
        }

        inner.propagate(&command).await
    }

    /// Write a command record on behalf of the legacy engine.
    ///
    /// Inside an execution scope the record is tagged remote, so the poll
    /// fallback will not send it back out.
    pub fn record_command(&self, command: LotteryCommand) {
        let origin = if self.inner.in_scope() {
            Origin::Remote
        } else {
            Origin::Local(self.inner.next_local())
        };
        self.inner.write_record(command, origin);
    }

    /// Start the poll-and-diff fallback over the local command record
    pub fn spawn_poll(&self, interval: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.poll.lock().replace(token.clone()) {
            previous.cancel();
        }

        // Whatever is cached now predates us and must not be re-sent
        *self.inner.last_seen.lock() = self
            .inner
            .adapter
            .get_cached(paths::COMMAND)
            .map(|v| v.to_string());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => inner.poll_once().await,
                }
            }
            debug!("Command poll stopped");
        });
    }

    /// Run one poll-and-diff pass now
    pub async fn poll_now(&self) {
        self.inner.poll_once().await;
    }

    /// Deregister command handlers and stop polling
    pub fn cleanup(&self) {
        if let Some(token) = self.inner.poll.lock().take() {
            token.cancel();
        }
        for (event_type, id) in self.inner.handlers.lock().drain(..) {
            self.inner.bus.off(event_type, id);
        }
    }
}

impl BridgeInner {
    fn in_scope(&self) -> bool {
        self.executing.load(Ordering::SeqCst) > 0
    }

    fn next_local(&self) -> u64 {
        self.local_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn undeliverable(&self, command: &LotteryCommand) -> SyncError {
        warn!(command = %command, "Remote store unreachable; remote commands cannot be delivered");
        SyncError::CommandUndeliverable(format!(
            "{} not sent: remote store unreachable and this client has no local engine",
            command
        ))
    }

    fn on_command_event(&self, event: &Event) -> HandlerResult {
        if let Origin::Local(_) = event.origin_for(self.bus.client_id()) {
            trace!(event_id = %event.id, "Skipping own command echo");
            return Ok(());
        }
        let Some(engine) = self.engine.as_ref() else {
            return Ok(());
        };

        let command = LotteryCommand::from_event(event)?;
        info!(command = %command, event_id = %event.id, "Executing remote command");
        self.execute(engine.as_ref(), &command, Origin::Remote);
        Ok(())
    }

    /// Run `command` on the engine inside an execution scope
    fn execute(&self, engine: &dyn LegacyEngine, command: &LotteryCommand, origin: Origin) {
        let _scope = ExecutionScope::enter(&self.executing);

        // Record first; the poll fallback must treat it as already seen
        if let Some(serialized) = self.write_record(command.clone(), origin) {
            *self.last_seen.lock() = Some(serialized);
        }

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| match command {
            LotteryCommand::Start { prize } => engine.start(prize.as_ref()),
            LotteryCommand::Stop => engine.stop(),
            LotteryCommand::Reset => engine.reset(),
        }));
        if result.is_err() {
            error!(command = %command, "Legacy engine panicked while executing command");
        }
    }

    /// Write the local command record; returns its serialized form
    fn write_record(&self, command: LotteryCommand, origin: Origin) -> Option<String> {
        let record = CommandRecord {
            command,
            origin,
            issued_at: now_ms(),
        };
        match serde_json::to_value(&record) {
            Ok(value) => {
                self.adapter.set_cached(paths::COMMAND, &value);
                Some(value.to_string())
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode command record");
                None
            }
        }
    }

    async fn propagate(&self, command: &LotteryCommand) -> SyncResult<Delivery> {
        let delivered = self
            .bus
            .broadcast_event(command.event_type(), Value::Object(command.payload()))
            .await;

        if delivered {
            info!(command = %command, "Command broadcast");
            Ok(Delivery::Delivered)
        } else if self.engine.is_some() {
            debug!(command = %command, "Command applied locally only");
            Ok(Delivery::LocalOnly)
        } else {
            Err(self.undeliverable(command))
        }
    }

    async fn poll_once(&self) {
        let Some(value) = self.adapter.get_cached(paths::COMMAND) else {
            return;
        };
        let serialized = value.to_string();
        {
            let mut last = self.last_seen.lock();
            if last.as_deref() == Some(serialized.as_str()) {
                return;
            }
            *last = Some(serialized);
        }

        let record: CommandRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Unreadable command record ignored");
                return;
            }
        };

        match record.origin {
            Origin::Remote => trace!(command = %record.command, "Ignoring remotely triggered command record"),
            Origin::Local(_) if self.in_scope() => {
                trace!(command = %record.command, "Ignoring command record written during execution")
            }
            Origin::Local(counter) => {
                info!(command = %record.command, counter, "Propagating local command");
                if let Err(e) = self.propagate(&record.command).await {
                    warn!(error = %e, "Local command not propagated");
                }
            }
        }
    }
}
