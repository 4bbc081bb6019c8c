//! ACID-durable key-value store backed by redb.
//!
//! Holds the small amount of state that must survive crashes independently of
//! the WAL: a partition's accepted generation and a coordinator's commit
//! decisions. Provides full transactional guarantees.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::StoreError;
use crate::store::StoreResult;

/// Table for general metadata (binary keys → binary values).
const META_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("meta");

/// ACID-durable store using redb.
///
/// All writes go through transactions. Reads use MVCC snapshots.
pub struct DurableStore {
    db: Arc<Database>,
}

impl DurableStore {
    /// Open or create a durable store at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io { source: e })?;
        }
        let db = Database::create(path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", path.display()),
        })?;

        // Create the table up front so reads on a fresh store succeed.
        let txn = db.begin_write().map_err(|e| StoreError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        txn.open_table(META_TABLE).map_err(|e| StoreError::Redb {
            message: format!("open_table failed: {e}"),
        })?;
        txn.commit().map_err(|e| StoreError::Redb {
            message: format!("commit failed: {e}"),
        })?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Store a key-value pair with full ACID guarantees.
    pub fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        {
            let mut table = txn.open_table(META_TABLE).map_err(|e| StoreError::Redb {
                message: format!("open_table failed: {e}"),
            })?;
            table.insert(key, value).map_err(|e| StoreError::Redb {
                message: format!("insert failed: {e}"),
            })?;
        }
        txn.commit().map_err(|e| StoreError::Redb {
            message: format!("commit failed: {e}"),
        })?;
        Ok(())
    }

    /// Read a value by key. Returns `Ok(None)` if the key doesn't exist.
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Redb {
            message: format!("begin_read failed: {e}"),
        })?;
        let table = txn.open_table(META_TABLE).map_err(|e| StoreError::Redb {
            message: format!("open_table failed: {e}"),
        })?;
        let result = table.get(key).map_err(|e| StoreError::Redb {
            message: format!("get failed: {e}"),
        })?;
        Ok(result.map(|guard| guard.value().to_vec()))
    }

    /// Delete a key. Returns whether the key existed.
    pub fn remove(&self, key: &[u8]) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        let existed = {
            let mut table = txn.open_table(META_TABLE).map_err(|e| StoreError::Redb {
                message: format!("open_table failed: {e}"),
            })?;
            let result = table.remove(key).map_err(|e| StoreError::Redb {
                message: format!("remove failed: {e}"),
            })?;
            result.is_some()
        };
        txn.commit().map_err(|e| StoreError::Redb {
            message: format!("commit failed: {e}"),
        })?;
        Ok(existed)
    }

    /// Scan all keys with the given prefix, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Redb {
            message: format!("begin_read failed: {e}"),
        })?;
        let table = txn.open_table(META_TABLE).map_err(|e| StoreError::Redb {
            message: format!("open_table failed: {e}"),
        })?;
        let range = table.range(prefix..).map_err(|e| StoreError::Redb {
            message: format!("range failed: {e}"),
        })?;

        let mut out = Vec::new();
        for item in range {
            let (k, v) = item.map_err(|e| StoreError::Redb {
                message: format!("range read failed: {e}"),
            })?;
            let key = k.value().to_vec();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, v.value().to_vec()));
        }
        Ok(out)
    }

    /// Read a little-endian `u64` value.
    pub fn get_u64(&self, key: &[u8]) -> StoreResult<Option<u64>> {
        match self.get(key)? {
            None => Ok(None),
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::Serialization {
                        message: format!("expected 8 bytes for u64 key, found {}", bytes.len()),
                    }
                })?;
                Ok(Some(u64::from_le_bytes(arr)))
            }
        }
    }

    /// Store a little-endian `u64` value.
    pub fn put_u64(&self, key: &[u8], value: u64) -> StoreResult<()> {
        self.put(key, &value.to_le_bytes())
    }
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore").finish()
    }
}
