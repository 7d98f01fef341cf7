//! Synchronization layer
//!
//! Keeps lottery state and commands consistent between clients sharing
//! one remote key/value store, with a local cache standing in while the
//! store is unreachable.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  CommandBridge (start/stop/reset ↔ legacy engine hooks)         │
//! │  StateReconciler (canonical LotteryState, merge + validate)     │
//! │        │                          │                             │
//! │        └──────────┬───────────────┘                             │
//! │                   ▼                                             │
//! │  EventBus (typed events at events/<id>, dedupe, freshness)      │
//! │                   │                                             │
//! │                   ▼                                             │
//! │  RemoteAdapter                                                  │
//! │  ├── RemoteStore (push subscriptions while online)              │
//! │  ├── Storage (redb cache, polled while degraded)                │
//! │  └── connectivity monitor → resync on reconnect                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let adapter = RemoteAdapter::connect(remote, Storage::in_memory()?, &config).await;
//! let bus = EventBus::new(adapter.clone(), ClientId::new(), &config);
//! let reconciler = StateReconciler::new(adapter, bus.clone()).await;
//!
//! reconciler.start_lottery(PrizeRef::new("p1", "Bicycle")).await?;
//! ```

pub mod adapter;
pub mod bridge;
pub mod bus;
pub mod reconciler;

pub use adapter::{RemoteAdapter, RemoteHandle, SubscriptionId};
pub use bridge::{CommandBridge, CommandRecord, Delivery, LegacyEngine, LotteryCommand};
pub use bus::{EventBus, HandlerId, HandlerResult};
pub use reconciler::{StateListener, StateReconciler};
