//! Core types for Lottery Sync

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::error::{SyncError, SyncResult};

/// Well-known remote store paths
pub mod paths {
    /// Canonical lottery state document
    pub const STATE: &str = "lotteryState";
    /// Prize catalogue
    pub const PRIZES: &str = "prizes";
    /// Employee (participant) list
    pub const EMPLOYEES: &str = "employees";
    /// Winner list as written by the legacy engine
    pub const WINNERS: &str = "winners";
    /// Bonus round settings
    pub const BONUS_SETTINGS: &str = "bonusSettings";
    /// Shared event collection; children live at `events/<id>`
    pub const EVENTS: &str = "events";
    /// Local command record polled by the command bridge
    pub const COMMAND: &str = "lotteryCommand";

    /// Path of a single event under the shared collection
    pub fn event(id: &str) -> String {
        format!("{}/{}", EVENTS, id)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Identifier of one client process
///
/// Generated once per process; used to recognise our own events when
/// the remote store reflects them back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Ulid);

impl ClientId {
    /// Create a new ClientId with current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client_{}", self.0)
    }
}

/// Unique identifier for an event
///
/// Fresh ids are ULIDs (time + randomness) but any string read back from
/// the store is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Generate a fresh, time-ordered id
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kinds of events carried on the shared bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    StartLottery,
    StopLottery,
    ResetLottery,
    LotteryResult,
    EmployeesUpdated,
    PrizesUpdated,
    StateChanged,
    SystemReady,
    ConnectionStatus,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::StartLottery,
        EventType::StopLottery,
        EventType::ResetLottery,
        EventType::LotteryResult,
        EventType::EmployeesUpdated,
        EventType::PrizesUpdated,
        EventType::StateChanged,
        EventType::SystemReady,
        EventType::ConnectionStatus,
    ];

    /// Wire name of the event type
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StartLottery => "START_LOTTERY",
            EventType::StopLottery => "STOP_LOTTERY",
            EventType::ResetLottery => "RESET_LOTTERY",
            EventType::LotteryResult => "LOTTERY_RESULT",
            EventType::EmployeesUpdated => "EMPLOYEES_UPDATED",
            EventType::PrizesUpdated => "PRIZES_UPDATED",
            EventType::StateChanged => "STATE_CHANGED",
            EventType::SystemReady => "SYSTEM_READY",
            EventType::ConnectionStatus => "CONNECTION_STATUS",
        }
    }

    /// Parse a wire name
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publisher tag attached to every event this crate writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    /// Publishing client
    pub client: ClientId,
    /// Per-client monotonic counter
    pub counter: u64,
}

/// Where a mutation came from, relative to the observing client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "counter", rename_all = "lowercase")]
pub enum Origin {
    /// Originated in this client; carries the local mutation counter
    Local(u64),
    /// Originated in another client (or is being replayed on its behalf)
    Remote,
}

impl Default for Origin {
    fn default() -> Self {
        Origin::Local(0)
    }
}

/// Which backend delivered a data change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// Pushed by the remote store subscription
    Remote,
    /// Read back from the local cache by the polling fallback
    Local,
}

/// An immutable, published fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Publish time in ms since the Unix epoch
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Stamp>,
}

impl Event {
    /// Create an event with a fresh id and the current timestamp
    pub fn new(event_type: EventType, payload: Map<String, Value>) -> Self {
        Self {
            id: EventId::generate(),
            event_type,
            payload,
            timestamp: now_ms(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, stamp: Stamp) -> Self {
        self.origin = Some(stamp);
        self
    }

    /// Store path of this event
    pub fn path(&self) -> String {
        paths::event(self.id.as_str())
    }

    pub fn age_ms(&self, now: i64) -> i64 {
        now.saturating_sub(self.timestamp)
    }

    /// Whether the event is inside the freshness window at `now`
    pub fn is_fresh(&self, now: i64, window_ms: i64) -> bool {
        self.age_ms(now) <= window_ms
    }

    /// Classify the event relative to `client`
    pub fn origin_for(&self, client: ClientId) -> Origin {
        match self.origin {
            Some(stamp) if stamp.client == client => Origin::Local(stamp.counter),
            _ => Origin::Remote,
        }
    }
}

/// Normalise an arbitrary JSON value into an event payload map
///
/// Objects are used as-is, `null` becomes an empty payload and anything
/// else is wrapped under `"value"`.
pub fn payload_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Phase of the current lottery round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LotteryStatus {
    #[default]
    Waiting,
    Rolling,
    Showing,
    Finished,
}

impl std::fmt::Display for LotteryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LotteryStatus::Waiting => "waiting",
            LotteryStatus::Rolling => "rolling",
            LotteryStatus::Showing => "showing",
            LotteryStatus::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Reference to a prize; fields beyond `id` and `name` are preserved as-is
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrizeRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PrizeRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            extra: Map::new(),
        }
    }
}

/// Reference to a drawn employee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinnerRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WinnerRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            extra: Map::new(),
        }
    }
}

/// One entry in the winner history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerRecord {
    pub winner: WinnerRef,
    #[serde(default)]
    pub prize: Option<PrizeRef>,
    #[serde(default)]
    pub drawn_at: i64,
}

/// The single shared lottery state
///
/// Keys this version does not know about are kept in `extra` so a
/// shallow merge never drops fields written by other clients.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LotteryState {
    pub status: LotteryStatus,
    pub current_prize: Option<PrizeRef>,
    pub current_winner: Option<WinnerRef>,
    pub winners: Vec<WinnerRecord>,
    pub completed_prizes: Vec<PrizeRef>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LotteryState {
    /// Check the status/field invariants
    pub fn validate(&self) -> SyncResult<()> {
        match self.status {
            LotteryStatus::Rolling if self.current_prize.is_none() => Err(
                SyncError::InvalidState("status rolling requires currentPrize".to_string()),
            ),
            LotteryStatus::Showing if self.current_winner.is_none() => Err(
                SyncError::InvalidState("status showing requires currentWinner".to_string()),
            ),
            _ => Ok(()),
        }
    }

    pub fn to_value(&self) -> SyncResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> SyncResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// A partial update to [`LotteryState`]
///
/// Every key present replaces the corresponding key in the state; absent
/// keys are left untouched. Setting a nullable field to `None` writes an
/// explicit `null`, which clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch(Map<String, Value>);

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a patch from a raw JSON object
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Build a patch that replaces every field with those of `state`
    pub fn from_state(state: &LotteryState) -> SyncResult<Self> {
        match state.to_value()? {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(SyncError::Serialization(
                "lottery state did not serialize to an object".to_string(),
            )),
        }
    }

    pub fn status(self, status: LotteryStatus) -> Self {
        self.set("status", status)
    }

    pub fn current_prize(self, prize: Option<PrizeRef>) -> Self {
        self.set("currentPrize", prize)
    }

    pub fn current_winner(self, winner: Option<WinnerRef>) -> Self {
        self.set("currentWinner", winner)
    }

    pub fn winners(self, winners: Vec<WinnerRecord>) -> Self {
        self.set("winners", winners)
    }

    pub fn completed_prizes(self, prizes: Vec<PrizeRef>) -> Self {
        self.set("completedPrizes", prizes)
    }

    /// Set an arbitrary key
    pub fn set<T: Serialize>(mut self, key: &str, value: T) -> Self {
        // Our own field types always serialize; fall back to null otherwise.
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.0.insert(key.to_string(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Shallow-merge this patch over `base`, returning the merged state
    pub fn apply_to(&self, base: &LotteryState) -> SyncResult<LotteryState> {
        let mut merged = match base.to_value()? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in &self.0 {
            merged.insert(key.clone(), value.clone());
        }
        LotteryState::from_value(Value::Object(merged))
    }
}
