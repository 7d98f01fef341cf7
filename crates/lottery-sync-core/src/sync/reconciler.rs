//! State reconciler
//!
//! Holds this client's canonical [`LotteryState`] and routes every
//! mutation through one merge entry point:
//!
//! 1. shallow-merge the patch (field-level last-write-wins)
//! 2. validate the status invariants
//! 3. persist the full state at `lotteryState`
//! 4. optionally publish `STATE_CHANGED` with the full state
//!
//! The reconciler also listens for `STATE_CHANGED`. Events stamped by
//! this client with a counter no newer than its last local mutation are
//! our own echoes and are skipped; everything else is merged and
//! persisted without republishing.
//!
//! Co-located collaborators (the legacy engine) may also write the cached
//! `lotteryState` directly. [`StateReconciler::spawn_cache_poll`] diffs
//! that entry against the values the reconciler itself wrote and feeds
//! foreign writes through [`StateReconciler::update_state`].

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::adapter::RemoteAdapter;
use super::bus::{EventBus, HandlerId, HandlerResult};
use crate::error::{SyncError, SyncResult};
use crate::types::{
    now_ms, paths, Event, EventType, LotteryState, LotteryStatus, Origin, PrizeRef, StatePatch,
    WinnerRecord, WinnerRef,
};

/// How many of our own cache writes are remembered for the cache poll
const WRITTEN_HISTORY: usize = 8;

/// Callback invoked with the merged state after every accepted mutation
pub type StateListener = Arc<dyn Fn(&LotteryState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeMode {
    /// `winners` may only grow
    Normal,
    /// Explicit reset; `winners` may shrink
    Reset,
}

struct ReconcilerInner {
    adapter: RemoteAdapter,
    bus: EventBus,
    state: RwLock<LotteryState>,
    /// Stamp counter of the newest locally published mutation
    last_local: AtomicU64,
    listeners: RwLock<Vec<StateListener>>,
    handler: Mutex<Option<HandlerId>>,
    /// Serialized states this reconciler wrote to `lotteryState`, newest last
    written: Mutex<VecDeque<String>>,
    poll: Mutex<Option<CancellationToken>>,
}

/// Canonical state holder for one client
#[derive(Clone)]
pub struct StateReconciler {
    inner: Arc<ReconcilerInner>,
}

impl StateReconciler {
    /// Hydrate from the store and start absorbing remote updates.
    ///
    /// The stored state (remote if reachable, else cached) is merged over
    /// the defaults before any update is accepted. An unreadable or
    /// invalid stored state is logged and ignored.
    pub async fn new(adapter: RemoteAdapter, bus: EventBus) -> Self {
        let stored = adapter.get_data(paths::STATE).await;
        // The hydrated value is now mirrored in the cache; it is not a foreign write
        let written: VecDeque<String> = stored.iter().map(|v| v.to_string()).collect();
        let state = match stored {
            Some(Value::Object(map)) => {
                match StatePatch::from_map(map).apply_to(&LotteryState::default()) {
                    Ok(state) if state.validate().is_ok() => state,
                    Ok(state) => {
                        warn!(status = %state.status, "Stored lottery state violates invariants; using defaults");
                        LotteryState::default()
                    }
                    Err(e) => {
                        warn!(error = %e, "Stored lottery state unreadable; using defaults");
                        LotteryState::default()
                    }
                }
            }
            Some(other) => {
                warn!(value = %other, "Stored lottery state is not an object; using defaults");
                LotteryState::default()
            }
            None => LotteryState::default(),
        };
        info!(status = %state.status, winners = state.winners.len(), "Lottery state hydrated");

        let inner = Arc::new(ReconcilerInner {
            adapter,
            bus,
            state: RwLock::new(state),
            last_local: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
            handler: Mutex::new(None),
            written: Mutex::new(written),
            poll: Mutex::new(None),
        });

        let weak: Weak<ReconcilerInner> = Arc::downgrade(&inner);
        let id = inner.bus.on(EventType::StateChanged, move |event| match weak.upgrade() {
            Some(inner) => inner.on_state_changed(event),
            None => Ok(()),
        });
        *inner.handler.lock() = Some(id);

        Self { inner }
    }

    /// Copy of the canonical state
    pub fn state(&self) -> LotteryState {
        self.inner.state.read().clone()
    }

    /// Register a listener for every accepted state change
    pub fn on_state_changed<F>(&self, listener: F)
    where
        F: Fn(&LotteryState) + Send + Sync + 'static,
    {
        self.inner.listeners.write().push(Arc::new(listener));
    }

    /// Merge `patch` into the canonical state and persist it.
    ///
    /// With `broadcast` the merged state is also published as
    /// `STATE_CHANGED`. A patch that would break an invariant is rejected
    /// with `SyncError::InvalidState` and leaves the state untouched.
    pub async fn update_state(&self, patch: StatePatch, broadcast: bool) -> SyncResult<LotteryState> {
        self.mutate(move |_| Ok(patch), broadcast, MergeMode::Normal)
            .await
    }

    /// Start a round for `prize`
    pub async fn start_lottery(&self, prize: PrizeRef) -> SyncResult<LotteryState> {
        let patch = StatePatch::new()
            .status(LotteryStatus::Rolling)
            .current_prize(Some(prize))
            .current_winner(None);
        self.update_state(patch, true).await
    }

    /// Show `winner` and append it to the winner history
    pub async fn show_winner(&self, winner: WinnerRef) -> SyncResult<LotteryState> {
        self.mutate(
            move |state| {
                let mut winners = state.winners.clone();
                winners.push(WinnerRecord {
                    winner: winner.clone(),
                    prize: state.current_prize.clone(),
                    drawn_at: now_ms(),
                });
                Ok(StatePatch::new()
                    .status(LotteryStatus::Showing)
                    .current_winner(Some(winner))
                    .winners(winners))
            },
            true,
            MergeMode::Normal,
        )
        .await
    }

    /// Finish the current prize
    pub async fn complete_prize(&self) -> SyncResult<LotteryState> {
        self.mutate(
            |state| {
                let prize = state.current_prize.clone().ok_or_else(|| {
                    SyncError::InvalidState("no current prize to complete".to_string())
                })?;
                let mut completed = state.completed_prizes.clone();
                completed.push(prize);
                Ok(StatePatch::new()
                    .status(LotteryStatus::Finished)
                    .completed_prizes(completed))
            },
            true,
            MergeMode::Normal,
        )
        .await
    }

    /// Back to waiting; winner history is kept
    pub async fn reset_lottery(&self) -> SyncResult<LotteryState> {
        let patch = StatePatch::new()
            .status(LotteryStatus::Waiting)
            .current_prize(None)
            .current_winner(None);
        self.update_state(patch, true).await
    }

    /// Full reset, including winners and completed prizes
    pub async fn clear_all_data(&self) -> SyncResult<LotteryState> {
        let patch = StatePatch::from_state(&LotteryState::default())?;
        self.mutate(move |_| Ok(patch), true, MergeMode::Reset).await
    }

    /// Start diffing the cached `lotteryState` for writes made by others
    pub fn spawn_cache_poll(&self, interval: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.poll.lock().replace(token.clone()) {
            previous.cancel();
        }

        let reconciler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => reconciler.poll_cache_now().await,
                }
            }
            debug!("State cache poll stopped");
        });
    }

    /// Run one cache diff pass now.
    ///
    /// A cached value the reconciler did not write is merged as a local
    /// update and broadcast.
    pub async fn poll_cache_now(&self) {
        let Some(value) = self.inner.adapter.get_cached(paths::STATE) else {
            return;
        };
        let serialized = value.to_string();
        if self.inner.written.lock().contains(&serialized) {
            return;
        }
        self.inner.remember_written(serialized);

        let Value::Object(map) = value else {
            warn!("Cached lottery state is not an object; ignored");
            return;
        };
        let patch = StatePatch::from_map(map);
        match patch.apply_to(&self.state()) {
            Ok(merged) if merged == self.state() => return,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Unreadable cached lottery state ignored");
                return;
            }
        }

        info!("Cached lottery state changed outside the reconciler; propagating");
        if let Err(e) = self.update_state(patch, true).await {
            warn!(error = %e, "Cached lottery state rejected");
        }
    }

    /// Stop listening for remote state changes
    pub fn cleanup(&self) {
        if let Some(token) = self.inner.poll.lock().take() {
            token.cancel();
        }
        if let Some(id) = self.inner.handler.lock().take() {
            self.inner.bus.off(EventType::StateChanged, id);
        }
        self.inner.listeners.write().clear();
    }

    /// The single local merge entry point
    async fn mutate<F>(&self, build: F, broadcast: bool, mode: MergeMode) -> SyncResult<LotteryState>
    where
        F: FnOnce(&LotteryState) -> SyncResult<StatePatch>,
    {
        let merged = {
            let mut state = self.inner.state.write();
            let patch = build(&*state)?;
            let merged = patch.apply_to(&state)?;
            merged.validate()?;
            if mode == MergeMode::Normal && merged.winners.len() < state.winners.len() {
                return Err(SyncError::InvalidState(
                    "winners only grow until an explicit reset".to_string(),
                ));
            }
            *state = merged.clone();
            merged
        };

        // Claim the stamp before anything can echo back
        let stamp = broadcast.then(|| {
            let stamp = self.inner.bus.next_stamp();
            self.inner.last_local.fetch_max(stamp.counter, Ordering::SeqCst);
            stamp
        });

        debug!(status = %merged.status, broadcast, "Local state update");
        self.inner.notify(&merged);

        // Persist the latest canonical copy so interleaved updates never regress it
        let snapshot = self.state();
        let value = snapshot.to_value()?;
        self.inner.remember_written(value.to_string());
        self.inner.adapter.set_data(paths::STATE, value.clone()).await;

        if let Some(stamp) = stamp {
            let mut payload = serde_json::Map::new();
            payload.insert("state".to_string(), value);
            let event = Event::new(EventType::StateChanged, payload).with_origin(stamp);
            self.inner.bus.publish(event).await;
        }

        Ok(merged)
    }
}

impl ReconcilerInner {
    fn on_state_changed(self: &Arc<Self>, event: &Event) -> HandlerResult {
        if let Origin::Local(counter) = event.origin_for(self.bus.client_id()) {
            if counter <= self.last_local.load(Ordering::SeqCst) {
                trace!(event_id = %event.id, counter, "Skipping own state echo");
                return Ok(());
            }
        }

        let Some(Value::Object(remote)) = event.payload.get("state").cloned() else {
            return Err(format!("STATE_CHANGED {} carries no state object", event.id).into());
        };

        let merged = {
            let mut state = self.state.write();
            let merged = StatePatch::from_map(remote).apply_to(&state)?;
            merged.validate()?;
            if *state == merged {
                trace!(event_id = %event.id, "Remote state already applied");
                return Ok(());
            }
            *state = merged.clone();
            merged
        };

        debug!(event_id = %event.id, status = %merged.status, "Applied remote state");
        self.notify(&merged);

        // Persist like a local non-broadcast update; this also repairs the
        // remote path after a resync pushed our stale cached copy over it
        let inner = self.clone();
        tokio::spawn(async move {
            let snapshot = inner.state.read().clone();
            match snapshot.to_value() {
                Ok(value) => {
                    inner.remember_written(value.to_string());
                    inner.adapter.set_data(paths::STATE, value).await;
                }
                Err(e) => warn!(error = %e, "Failed to encode merged state"),
            }
        });
        Ok(())
    }

    fn remember_written(&self, serialized: String) {
        let mut written = self.written.lock();
        if written.len() == WRITTEN_HISTORY {
            written.pop_front();
        }
        written.push_back(serialized);
    }

    fn notify(&self, state: &LotteryState) {
        let listeners: Vec<StateListener> = self.listeners.read().clone();
        for listener in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
                warn!("State listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::remote::MemoryHub;
    use crate::storage::Storage;
    use crate::types::ClientId;
    use serde_json::json;
    use std::time::Duration;

    fn test_config() -> SyncConfig {
        SyncConfig {
            poll_interval_ms: 20,
            ..Default::default()
        }
    }

    async fn reconciler_on(hub: &MemoryHub) -> StateReconciler {
        let adapter = RemoteAdapter::connect(
            Arc::new(hub.link()),
            Storage::in_memory().unwrap(),
            &test_config(),
        )
        .await;
        let bus = EventBus::new(adapter.clone(), ClientId::new(), &test_config());
        StateReconciler::new(adapter, bus).await
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_defaults_when_store_empty() {
        let hub = MemoryHub::new();
        let reconciler = reconciler_on(&hub).await;
        assert_eq!(reconciler.state(), LotteryState::default());
    }

    #[tokio::test]
    async fn test_hydrates_from_store_over_defaults() {
        let hub = MemoryHub::new();
        hub.write(
            "lotteryState",
            json!({"status": "rolling", "currentPrize": {"id": "p1", "name": "Prize1"}}),
        );

        let reconciler = reconciler_on(&hub).await;
        let state = reconciler.state();
        assert_eq!(state.status, LotteryStatus::Rolling);
        assert_eq!(state.current_prize.unwrap().id, "p1");
        assert!(state.winners.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_stored_state_falls_back_to_defaults() {
        let hub = MemoryHub::new();
        hub.write("lotteryState", json!({"status": "showing"}));

        let reconciler = reconciler_on(&hub).await;
        assert_eq!(reconciler.state(), LotteryState::default());
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let hub = MemoryHub::new();
        let reconciler = reconciler_on(&hub).await;
        let prize = PrizeRef::new("p1", "Prize1");
        let winner = WinnerRef::new("e7", "Lin");

        reconciler
            .update_state(
                StatePatch::new()
                    .status(LotteryStatus::Rolling)
                    .current_prize(Some(prize.clone())),
                true,
            )
            .await
            .unwrap();
        reconciler
            .update_state(StatePatch::new().current_winner(Some(winner.clone())), true)
            .await
            .unwrap();

        let state = reconciler.state();
        assert_eq!(state.status, LotteryStatus::Rolling);
        assert_eq!(state.current_prize, Some(prize));
        assert_eq!(state.current_winner, Some(winner));

        // Persisted remotely as the full merged state
        let stored = LotteryState::from_value(hub.read("lotteryState").unwrap()).unwrap();
        assert_eq!(stored, state);
    }

    #[tokio::test]
    async fn test_invalid_update_rejected_and_state_unchanged() {
        let hub = MemoryHub::new();
        let reconciler = reconciler_on(&hub).await;

        let err = reconciler
            .update_state(StatePatch::new().status(LotteryStatus::Rolling), true)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));
        assert_eq!(reconciler.state(), LotteryState::default());
        assert!(hub.read("lotteryState").is_none());
    }

    #[tokio::test]
    async fn test_round_lifecycle() {
        let hub = MemoryHub::new();
        let reconciler = reconciler_on(&hub).await;
        let prize = PrizeRef::new("p1", "Prize1");

        let state = reconciler.start_lottery(prize.clone()).await.unwrap();
        assert_eq!(state.status, LotteryStatus::Rolling);
        assert_eq!(state.current_winner, None);

        let state = reconciler
            .show_winner(WinnerRef::new("e1", "Ada"))
            .await
            .unwrap();
        assert_eq!(state.status, LotteryStatus::Showing);
        assert_eq!(state.winners.len(), 1);
        assert_eq!(state.winners[0].prize, Some(prize.clone()));

        let state = reconciler.complete_prize().await.unwrap();
        assert_eq!(state.status, LotteryStatus::Finished);
        assert_eq!(state.completed_prizes, vec![prize]);

        let state = reconciler.reset_lottery().await.unwrap();
        assert_eq!(state.status, LotteryStatus::Waiting);
        assert_eq!(state.current_prize, None);
        assert_eq!(state.current_winner, None);
        assert_eq!(state.winners.len(), 1);

        let state = reconciler.clear_all_data().await.unwrap();
        assert_eq!(state, LotteryState::default());
    }

    #[tokio::test]
    async fn test_complete_without_prize_fails() {
        let hub = MemoryHub::new();
        let reconciler = reconciler_on(&hub).await;
        assert!(matches!(
            reconciler.complete_prize().await,
            Err(SyncError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_winners_cannot_shrink_without_reset() {
        let hub = MemoryHub::new();
        let reconciler = reconciler_on(&hub).await;
        reconciler
            .start_lottery(PrizeRef::new("p1", "Prize1"))
            .await
            .unwrap();
        reconciler
            .show_winner(WinnerRef::new("e1", "Ada"))
            .await
            .unwrap();

        let err = reconciler
            .update_state(StatePatch::new().winners(Vec::new()), true)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));
        assert_eq!(reconciler.state().winners.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_update_absorbed_without_republish() {
        let hub = MemoryHub::new();
        let a = reconciler_on(&hub).await;
        let b = reconciler_on(&hub).await;

        a.start_lottery(PrizeRef::new("p1", "Prize1")).await.unwrap();
        settle().await;

        let state = b.state();
        assert_eq!(state.status, LotteryStatus::Rolling);
        assert_eq!(state.current_prize.unwrap().id, "p1");

        // Only A published a STATE_CHANGED event
        let events = hub.read("events").unwrap();
        let state_events = events
            .as_object()
            .unwrap()
            .values()
            .filter(|e| e["type"] == json!("STATE_CHANGED"))
            .count();
        assert_eq!(state_events, 1);
    }

    #[tokio::test]
    async fn test_foreign_cache_write_is_propagated() {
        let hub = MemoryHub::new();
        let display = reconciler_on(&hub).await;
        let observer = reconciler_on(&hub).await;

        display.inner.adapter.set_cached(
            "lotteryState",
            &json!({"status": "rolling", "currentPrize": {"id": "p9", "name": "Camera"}}),
        );
        display.poll_cache_now().await;
        settle().await;

        assert_eq!(display.state().status, LotteryStatus::Rolling);
        assert_eq!(hub.read("lotteryState").unwrap()["currentPrize"]["id"], json!("p9"));
        assert_eq!(observer.state().current_prize.unwrap().id, "p9");
    }

    #[tokio::test]
    async fn test_own_cache_writes_not_propagated_again() {
        let hub = MemoryHub::new();
        let reconciler = reconciler_on(&hub).await;

        reconciler
            .start_lottery(PrizeRef::new("p1", "Prize1"))
            .await
            .unwrap();
        reconciler.poll_cache_now().await;
        reconciler.poll_cache_now().await;

        let state_events = hub
            .read("events")
            .unwrap()
            .as_object()
            .unwrap()
            .values()
            .filter(|e| e["type"] == json!("STATE_CHANGED"))
            .count();
        assert_eq!(state_events, 1);
    }

    #[tokio::test]
    async fn test_invalid_cache_write_rejected() {
        let hub = MemoryHub::new();
        let reconciler = reconciler_on(&hub).await;

        reconciler
            .inner
            .adapter
            .set_cached("lotteryState", &json!({"status": "showing"}));
        reconciler.poll_cache_now().await;

        assert_eq!(reconciler.state(), LotteryState::default());
        assert!(hub.read("events").is_none());
    }

    #[tokio::test]
    async fn test_own_echo_does_not_notify_twice() {
        let hub = MemoryHub::new();
        let reconciler = reconciler_on(&hub).await;
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        reconciler.on_state_changed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        reconciler
            .start_lottery(PrizeRef::new("p1", "Prize1"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_without_broadcast_publishes_nothing() {
        let hub = MemoryHub::new();
        let reconciler = reconciler_on(&hub).await;

        reconciler
            .update_state(StatePatch::new().set("round", 2), false)
            .await
            .unwrap();
        assert!(hub.read("events").is_none());
        assert_eq!(hub.read("lotteryState").unwrap()["round"], json!(2));
    }
}
