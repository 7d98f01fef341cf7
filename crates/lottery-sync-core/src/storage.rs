//! Local cache using redb.
//!
//! Every remote path has a mirror entry here under a derived key (see
//! [`cache_key`]), so reads keep working while the remote store is
//! unreachable. Entries are JSON-encoded [`CacheEntry`] records.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::SyncError;
use crate::types::now_ms;

const CACHE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("cache");

/// Prefix shared by every cache key
pub const CACHE_KEY_PREFIX: &str = "lottery_";

/// Derive the local cache key for a remote path
///
/// `events/01J...` becomes `lottery_events_01J...`.
pub fn cache_key(path: &str) -> String {
    format!("{}{}", CACHE_KEY_PREFIX, path.replace('/', "_"))
}

/// A cached value together with the time it was last written locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    /// Last write timestamp (ms since the Unix epoch)
    pub written_at: i64,
}

/// Local cache backed by redb
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// Creates the parent directory and the cache table if needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create a cache that lives only as long as this process
    pub fn in_memory() -> Result<Self, SyncError> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, SyncError> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(CACHE_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Write `value` under the cache key for `path`, overwriting any previous entry.
    pub fn put(&self, path: &str, value: &Value) -> Result<(), SyncError> {
        let entry = CacheEntry {
            value: value.clone(),
            written_at: now_ms(),
        };
        let data = serde_json::to_vec(&entry)?;

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CACHE_TABLE)?;
            let key = cache_key(path);
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the cached entry for `path`.
    ///
    /// Returns `None` if nothing is cached; a corrupt entry is a
    /// `SyncError::Serialization`.
    pub fn get_entry(&self, path: &str) -> Result<Option<CacheEntry>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CACHE_TABLE)?;
        let key = cache_key(path);

        match table.get(key.as_str())? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// Load the cached value for `path`.
    pub fn get(&self, path: &str) -> Result<Option<Value>, SyncError> {
        Ok(self.get_entry(path)?.map(|entry| entry.value))
    }

    /// Load `path`, composing it from child entries when it is a collection.
    ///
    /// A direct entry wins. Otherwise every entry below `path/` is gathered
    /// into an object keyed by child name; corrupt children are skipped.
    pub fn get_collection(&self, path: &str) -> Result<Option<Value>, SyncError> {
        if let Some(value) = self.get(path)? {
            return Ok(Some(value));
        }

        let prefix = format!("{}_", cache_key(path));
        let children = self.scan_prefix(&prefix)?;
        if children.is_empty() {
            return Ok(None);
        }

        let mut map = Map::new();
        for (key, raw) in children {
            let child = key[prefix.len()..].to_string();
            match serde_json::from_slice::<CacheEntry>(&raw) {
                Ok(entry) => {
                    map.insert(child, entry.value);
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping corrupt cache entry"),
            }
        }
        Ok(Some(Value::Object(map)))
    }

    /// Delete the cached entry for `path`.
    ///
    /// Returns `Ok(())` even if nothing was cached.
    pub fn remove(&self, path: &str) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CACHE_TABLE)?;
            let key = cache_key(path);
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Delete `path` and every child entry below it.
    pub fn remove_tree(&self, path: &str) -> Result<usize, SyncError> {
        let prefix = format!("{}_", cache_key(path));
        let keys: Vec<String> = self
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let mut removed = 0;
        {
            let mut table = write_txn.open_table(CACHE_TABLE)?;
            if table.remove(cache_key(path).as_str())?.is_some() {
                removed += 1;
            }
            for key in &keys {
                if table.remove(key.as_str())?.is_some() {
                    removed += 1;
                }
            }
        }
        write_txn.commit()?;
        Ok(removed)
    }

    /// List every cache entry as `(cache key, entry)` in key order.
    ///
    /// Corrupt entries are skipped.
    pub fn list(&self) -> Result<Vec<(String, CacheEntry)>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CACHE_TABLE)?;

        let mut entries = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            match serde_json::from_slice::<CacheEntry>(value.value()) {
                Ok(cached) => entries.push((key.value().to_string(), cached)),
                Err(e) => warn!(key = %key.value(), error = %e, "Skipping corrupt cache entry"),
            }
        }
        Ok(entries)
    }

    /// Raw entries whose cache key starts with `prefix`.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CACHE_TABLE)?;

        let mut out = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_string(), value.value().to_vec()));
        }
        Ok(out)
    }

    /// Write raw bytes under a cache key, bypassing encoding.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, path: &str, data: &[u8]) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CACHE_TABLE)?;
            table.insert(cache_key(path).as_str(), data)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("cache.redb");
        let storage = Storage::new(&db_path).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_cache_key_derivation() {
        assert_eq!(cache_key("lotteryState"), "lottery_lotteryState");
        assert_eq!(cache_key("events/abc"), "lottery_events_abc");
    }

    #[test]
    fn test_storage_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested/path/to/cache.redb");
        let storage = Storage::new(&db_path);
        assert!(storage.is_ok());
        assert!(db_path.exists());
    }

    #[test]
    fn test_put_and_get() {
        let (storage, _temp) = create_test_storage();

        storage.put("prizes", &json!([{"id": "p1"}])).unwrap();
        assert_eq!(storage.get("prizes").unwrap(), Some(json!([{"id": "p1"}])));
        assert!(storage.get("winners").unwrap().is_none());

        let entry = storage.get_entry("prizes").unwrap().unwrap();
        assert!(entry.written_at > 0);
    }

    #[test]
    fn test_put_overwrites() {
        let storage = Storage::in_memory().unwrap();

        storage.put("lotteryState", &json!({"status": "waiting"})).unwrap();
        storage.put("lotteryState", &json!({"status": "rolling"})).unwrap();
        assert_eq!(
            storage.get("lotteryState").unwrap(),
            Some(json!({"status": "rolling"}))
        );
    }

    #[test]
    fn test_remove() {
        let storage = Storage::in_memory().unwrap();

        storage.put("winners", &json!([])).unwrap();
        storage.remove("winners").unwrap();
        assert!(storage.get("winners").unwrap().is_none());
        // Removing again is fine
        storage.remove("winners").unwrap();
    }

    #[test]
    fn test_collection_composed_from_children() {
        let storage = Storage::in_memory().unwrap();

        storage.put("events/a", &json!({"id": "a"})).unwrap();
        storage.put("events/b", &json!({"id": "b"})).unwrap();
        storage.put("eventsX", &json!("not a child")).unwrap();

        let events = storage.get_collection("events").unwrap().unwrap();
        let map = events.as_object().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["a"], json!({"id": "a"}));
        assert_eq!(map["b"], json!({"id": "b"}));

        assert!(storage.get_collection("prizes").unwrap().is_none());
    }

    #[test]
    fn test_remove_tree() {
        let storage = Storage::in_memory().unwrap();

        storage.put("events/a", &json!(1)).unwrap();
        storage.put("events/b", &json!(2)).unwrap();
        storage.put("prizes", &json!([])).unwrap();

        assert_eq!(storage.remove_tree("events").unwrap(), 2);
        assert!(storage.get_collection("events").unwrap().is_none());
        assert!(storage.get("prizes").unwrap().is_some());
    }

    #[test]
    fn test_corrupt_entry_is_serialization_error() {
        let storage = Storage::in_memory().unwrap();

        storage.put_raw("lotteryState", b"{broken").unwrap();
        assert!(matches!(
            storage.get("lotteryState"),
            Err(SyncError::Serialization(_))
        ));
        // list skips it rather than failing
        assert!(storage.list().unwrap().is_empty());
    }

    #[test]
    fn test_cache_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("cache.redb");

        {
            let storage = Storage::new(&db_path).unwrap();
            storage.put("employees", &json!(["ada", "grace"])).unwrap();
        }

        {
            let storage = Storage::new(&db_path).unwrap();
            assert_eq!(
                storage.get("employees").unwrap(),
                Some(json!(["ada", "grace"]))
            );
            let keys: Vec<_> = storage.list().unwrap().into_iter().map(|(k, _)| k).collect();
            assert_eq!(keys, vec!["lottery_employees".to_string()]);
        }
    }
}
