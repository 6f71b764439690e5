//! redb-backed bucket store.
//!
//! Two tables:
//! - `buckets`: bucket name to unit, one row per existing bucket
//! - `entries`: composite key `bucket\0key` to value
//!
//! Commits use `Durability::None`. The store is rebuilt from the latest Raft
//! snapshot plus the log on every start, so it never has to survive a crash
//! on its own.

use std::collections::BTreeMap;
use std::path::Path;

use redb::{Database, Durability, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use super::{BucketStore, StoreError, StoreImage, StoreResult};

/// Buckets table: bucket name -> ()
const BUCKETS: TableDefinition<'_, &str, ()> = TableDefinition::new("buckets");

/// Entries table: composite key "bucket\0key" -> value
const ENTRIES: TableDefinition<'_, &str, &str> = TableDefinition::new("entries");

/// Convert any error with Display to a store error.
fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database {
        message: e.to_string(),
    }
}

/// Create a composite key for entries: "bucket\0key"
fn entry_key(bucket: &str, key: &str) -> String {
    format!("{bucket}\0{key}")
}

/// redb-based bucket store.
pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Opens or creates a database at `path`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened.
    pub fn open(path: &Path) -> StoreResult<Self> {
        debug!(?path, "Opening redb bucket store");
        let db = Database::create(path).map_err(db_err)?;
        Self::init(db)
    }

    /// Opens an in-memory database for testing.
    ///
    /// # Errors
    /// Returns an error if the database cannot be created.
    pub fn open_in_memory() -> StoreResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(db_err)?;
        Self::init(db)
    }

    /// Creates both tables so read transactions never see them missing.
    fn init(db: Database) -> StoreResult<Self> {
        let txn = db.begin_write().map_err(db_err)?;
        let _ = txn.open_table(BUCKETS).map_err(db_err)?;
        let _ = txn.open_table(ENTRIES).map_err(db_err)?;
        txn.commit().map_err(db_err)?;
        Ok(Self { db })
    }
}

impl BucketStore for RedbStore {
    fn get(&self, bucket: &str, key: &str) -> StoreResult<Option<String>> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(ENTRIES).map_err(db_err)?;
        let value = table
            .get(entry_key(bucket, key).as_str())
            .map_err(db_err)?
            .map(|v| v.value().to_string());
        Ok(value)
    }

    fn put(&mut self, bucket: &str, key: &str, value: &str) -> StoreResult<()> {
        let mut txn = self.db.begin_write().map_err(db_err)?;
        {
            let buckets = txn.open_table(BUCKETS).map_err(db_err)?;
            if buckets.get(bucket).map_err(db_err)?.is_none() {
                return Err(StoreError::BucketNotFound {
                    bucket: bucket.to_string(),
                });
            }

            let mut entries = txn.open_table(ENTRIES).map_err(db_err)?;
            entries
                .insert(entry_key(bucket, key).as_str(), value)
                .map_err(db_err)?;
        }
        txn.set_durability(Durability::None).map_err(db_err)?;
        txn.commit().map_err(db_err)
    }

    fn create_bucket(&mut self, bucket: &str) -> StoreResult<()> {
        let mut txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut buckets = txn.open_table(BUCKETS).map_err(db_err)?;
            if buckets.get(bucket).map_err(db_err)?.is_some() {
                return Err(StoreError::BucketExists {
                    bucket: bucket.to_string(),
                });
            }
            buckets.insert(bucket, ()).map_err(db_err)?;
        }
        txn.set_durability(Durability::None).map_err(db_err)?;
        txn.commit().map_err(db_err)
    }

    fn export(&self) -> StoreResult<StoreImage> {
        let txn = self.db.begin_read().map_err(db_err)?;

        let mut buckets: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let table = txn.open_table(BUCKETS).map_err(db_err)?;
        for row in table.iter().map_err(db_err)? {
            let (name, _) = row.map_err(db_err)?;
            buckets.insert(name.value().to_string(), BTreeMap::new());
        }

        let table = txn.open_table(ENTRIES).map_err(db_err)?;
        for row in table.iter().map_err(db_err)? {
            let (composite, value) = row.map_err(db_err)?;
            let (bucket, key) = composite
                .value()
                .split_once('\0')
                .ok_or(StoreError::CorruptImage {
                    reason: "entry key without bucket separator",
                })?;
            buckets
                .entry(bucket.to_string())
                .or_default()
                .insert(key.to_string(), value.value().to_string());
        }

        Ok(StoreImage { buckets })
    }

    fn import(&mut self, image: &StoreImage) -> StoreResult<()> {
        // One write transaction: readers see the old store or the new one.
        let mut txn = self.db.begin_write().map_err(db_err)?;
        txn.delete_table(BUCKETS).map_err(db_err)?;
        txn.delete_table(ENTRIES).map_err(db_err)?;
        {
            let mut buckets = txn.open_table(BUCKETS).map_err(db_err)?;
            let mut entries = txn.open_table(ENTRIES).map_err(db_err)?;
            for (bucket, rows) in &image.buckets {
                buckets.insert(bucket.as_str(), ()).map_err(db_err)?;
                for (key, value) in rows {
                    entries
                        .insert(entry_key(bucket, key).as_str(), value.as_str())
                        .map_err(db_err)?;
                }
            }
        }
        txn.set_durability(Durability::None).map_err(db_err)?;
        txn.commit().map_err(db_err)?;

        debug!(buckets = image.buckets.len(), "Imported store image");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let mut store = RedbStore::open_in_memory().unwrap();
        store.create_bucket("users").unwrap();
        store.put("users", "alice", "1").unwrap();

        assert_eq!(store.get("users", "alice").unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("users", "bob").unwrap(), None);
        assert!(matches!(
            store.put("missing", "k", "v"),
            Err(StoreError::BucketNotFound { .. })
        ));
    }

    #[test]
    fn test_create_bucket_twice_is_error() {
        let mut store = RedbStore::open_in_memory().unwrap();
        store.create_bucket("users").unwrap();
        store.put("users", "alice", "1").unwrap();
        let before = store.export().unwrap();

        assert!(matches!(
            store.create_bucket("users"),
            Err(StoreError::BucketExists { .. })
        ));
        assert_eq!(store.export().unwrap(), before);
    }

    #[test]
    fn test_import_replaces_everything() {
        let mut source = RedbStore::open_in_memory().unwrap();
        source.create_bucket("a").unwrap();
        source.create_bucket("empty").unwrap();
        source.put("a", "k1", "v1").unwrap();
        source.put("a", "k2", "v2").unwrap();
        let image = source.export().unwrap();

        let mut target = RedbStore::open_in_memory().unwrap();
        target.create_bucket("old").unwrap();
        target.put("old", "k", "v").unwrap();
        target.import(&image).unwrap();

        assert_eq!(target.export().unwrap(), image);
        assert_eq!(target.get("old", "k").unwrap(), None);
        assert_eq!(target.get("a", "k2").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn test_keys_with_shared_prefix_stay_in_their_bucket() {
        let mut store = RedbStore::open_in_memory().unwrap();
        store.create_bucket("a").unwrap();
        store.create_bucket("ab").unwrap();
        store.put("a", "b\0c", "1").unwrap();
        store.put("ab", "c", "2").unwrap();

        let image = store.export().unwrap();
        assert_eq!(image.buckets["a"]["b\0c"], "1");
        assert_eq!(image.buckets["ab"]["c"], "2");
    }

    #[test]
    fn test_reopen_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buckets.redb");
        {
            let mut store = RedbStore::open(&path).unwrap();
            store.create_bucket("b").unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert!(store.export().is_ok());
    }
}
