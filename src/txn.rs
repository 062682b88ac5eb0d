//! Snapshot transactions: a staged write set over a frozen read view,
//! applied atomically-in-sequence to the engine on commit (§4.7).

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::{self, Entry};
use crate::datafile::DataFile;
use crate::engine::{validate_key, Batch, Db};
use crate::error::{Error, Result};
use crate::keydir::{self, Item};

/// A short-lived handle combining a tree-txn over the directory at
/// construction time with a private in-memory staging file. Reads resolve
/// through the staging buffer, the frozen `previous` active file, or the
/// frozen readonly map, in that order. Writes land only in the staging
/// file and the tree-txn until [`Transaction::commit`] replays them through
/// the live engine.
pub struct Transaction<'a> {
    db: &'a Db,
    current: Arc<DataFile>,
    previous: Arc<DataFile>,
    datafiles: HashMap<i32, Arc<DataFile>>,
    trie: keydir::Txn,
    batch: Batch,
}

impl Db {
    /// Opens a transaction: a snapshot read view plus a staged write set
    /// that becomes visible only on [`Transaction::commit`] (§4.7).
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        if self.readonly_mode {
            return Err(Error::DatabaseReadonly);
        }
        let state = self.state.read().unwrap();
        Ok(Transaction {
            db: self,
            current: DataFile::new_in_memory(),
            previous: state.active.clone(),
            datafiles: state.readonly.clone(),
            trie: state.keydir.txn(),
            batch: Batch::new(),
        })
    }
}

impl<'a> Transaction<'a> {
    /// Reads `key` through this transaction's snapshot, including any
    /// not-yet-committed write staged earlier in the same transaction.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let item = self.trie.get(key).ok_or(Error::KeyNotFound)?;
        let file = self.resolve(item.file_id)?;
        let entry = file.read_at(item.offset, item.size)?;
        codec::verify_checksum(&entry)?;
        Ok(entry.value)
    }

    pub fn has(&self, key: &[u8]) -> bool {
        self.trie.get(key).is_some()
    }

    fn resolve(&self, file_id: i32) -> Result<Arc<DataFile>> {
        if file_id == self.current.id() {
            Ok(self.current.clone())
        } else if file_id == self.previous.id() {
            Ok(self.previous.clone())
        } else {
            self.datafiles.get(&file_id).cloned().ok_or(Error::KeyNotFound)
        }
    }

    /// Stages a put: appends to the private staging file, updates the
    /// tree-txn, and records the mutation in the batch to be replayed on
    /// commit.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        validate_key(key, self.db.config.max_key_size)?;
        if value.len() as u64 > self.db.config.max_value_size {
            return Err(Error::ValueTooLarge);
        }
        let entry = Entry::new(key.to_vec(), value.to_vec());
        let (offset, size) = self.current.write(&entry)?;
        self.trie.insert(key, Item { file_id: self.current.id(), offset, size });
        self.batch.put(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Stages a delete: appends a tombstone to the staging file, removes
    /// the key from the tree-txn, and records the mutation in the batch.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        validate_key(key, self.db.config.max_key_size)?;
        let entry = Entry::new(key.to_vec(), Vec::new());
        self.current.write(&entry)?;
        self.trie.delete(key);
        self.batch.delete(key.to_vec());
        Ok(())
    }

    /// Replays the staged batch through the live engine under its write
    /// lock (§4.5's write path applies, so `ReclaimableSpace` and rotation
    /// behave exactly as for a direct `Db::write_batch` call). The
    /// transaction's own staging tree is discarded; the engine's directory
    /// is the source of truth from this point on.
    pub fn commit(self) -> Result<()> {
        self.db.write_batch(&self.batch)
    }

    /// Drops the transaction without applying anything. Nothing staged by
    /// a transaction ever touches disk outside its own private staging
    /// file, so discarding one is always a no-op on the engine.
    pub fn discard(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use tempfile::tempdir;

    #[test]
    fn reads_own_uncommitted_writes() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path(), Options::new()).unwrap();
        db.put(b"a", b"1").unwrap();

        let mut txn = db.transaction().unwrap();
        assert_eq!(txn.get(b"a").unwrap(), b"1");
        txn.put(b"b", b"2").unwrap();
        assert_eq!(txn.get(b"b").unwrap(), b"2");
        // Not visible to the engine until commit.
        assert!(!db.has(b"b"));
        txn.commit().unwrap();
        assert_eq!(db.get(b"b").unwrap(), b"2");
    }

    #[test]
    fn discard_applies_nothing() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path(), Options::new()).unwrap();

        let mut txn = db.transaction().unwrap();
        txn.put(b"a", b"1").unwrap();
        txn.discard();

        assert!(!db.has(b"a"));
    }

    #[test]
    fn isolated_from_concurrent_writes() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path(), Options::new()).unwrap();
        db.put(b"a", b"1").unwrap();

        let txn = db.transaction().unwrap();
        db.put(b"a", b"2").unwrap();
        db.put(b"c", b"3").unwrap();

        // The transaction's snapshot predates both concurrent writes.
        assert_eq!(txn.get(b"a").unwrap(), b"1");
        assert!(!txn.has(b"c"));
        // The engine's own view reflects them immediately.
        assert_eq!(db.get(b"a").unwrap(), b"2");
    }

    #[test]
    fn delete_staged_then_committed() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path(), Options::new()).unwrap();
        db.put(b"a", b"1").unwrap();

        let mut txn = db.transaction().unwrap();
        txn.delete(b"a").unwrap();
        assert!(!txn.has(b"a"));
        assert!(db.has(b"a"));
        txn.commit().unwrap();
        assert!(!db.has(b"a"));
    }
}
