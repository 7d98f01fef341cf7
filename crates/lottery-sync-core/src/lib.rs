//! Lottery Sync Core Library
//!
//! Shared lottery state over a remote key/value store, with a local cache
//! that keeps every client usable while the store is unreachable.
//!
//! ## Overview
//!
//! Several clients (an admin console, a controller, a big-screen display)
//! coordinate one lottery session. Each client holds the canonical
//! [`LotteryState`], publishes typed events to the shared `events`
//! collection and turns start/stop/reset commands into calls on the
//! legacy in-process engine.
//!
//! ## Core Principles
//!
//! - **Cache first**: every write lands in the local redb cache before
//!   the remote store is tried
//! - **Degrade, then resync**: while disconnected, subscriptions poll the
//!   cache; on reconnect the cached paths are pushed back
//! - **Origin tagging**: events carry the publishing client and a counter,
//!   so echoes are recognised without timers
//!
//! ## Quick Start
//!
//! ```ignore
//! use lottery_sync_core::{ClientRole, LotteryClient, MemoryHub, Storage, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = MemoryHub::new();
//!     let admin = LotteryClient::connect(
//!         Arc::new(hub.link()),
//!         Storage::new("~/.lottery-sync/cache.redb")?,
//!         SyncConfig::default(),
//!         ClientRole::Admin,
//!         None,
//!     )
//!     .await?;
//!
//!     admin.update_prizes(json!([{"id": "p1", "name": "Bicycle"}])).await;
//!     admin.reconciler().start_lottery(PrizeRef::new("p1", "Bicycle")).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use client::{ClientInfo, ClientRole, LotteryClient};
pub use config::{RemoteConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use remote::{MemoryHub, MemoryRemote, RemoteStore, RemoteWatch};
pub use storage::{cache_key, CacheEntry, Storage};
pub use sync::{
    CommandBridge, CommandRecord, Delivery, EventBus, HandlerId, HandlerResult, LegacyEngine,
    LotteryCommand, RemoteAdapter, RemoteHandle, StateReconciler, SubscriptionId,
};
pub use types::*;
