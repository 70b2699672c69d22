//! Transactions: pessimistic per-key write locks, optimistic read
//! validation.
//!
//! A transaction buffers its writes and deletes locally, taking a per-key
//! writer lock from a process-wide registry on first mutation and holding
//! it until commit or rollback. Reads go through the engine and are
//! remembered (including observed absence); at commit the read set is
//! re-validated bytewise against current committed state, so a conflicting
//! writer aborts the transaction instead of silently losing the race.
//!
//! This yields snapshot-style isolation against committed state at
//! validation time, not at transaction start.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::engine::EngineInner;
use crate::error::{Error, Result};
use crate::memtable::wall_millis;

/// Process-wide table of per-key writer locks.
///
/// A key is locked by at most one transaction at a time; acquisition
/// blocks until the holder releases, and is reentrant for the holder.
pub(crate) struct KeyLockRegistry {
    owners: Mutex<HashMap<Vec<u8>, u64>>,
    released: Condvar,
}

impl KeyLockRegistry {
    fn new() -> Self {
        Self {
            owners: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    fn acquire(&self, key: &[u8], txn_id: u64) -> Result<()> {
        let mut owners = self.owners.lock()?;
        loop {
            match owners.get(key) {
                None => {
                    owners.insert(key.to_vec(), txn_id);
                    return Ok(());
                }
                Some(&owner) if owner == txn_id => return Ok(()),
                Some(_) => owners = self.released.wait(owners)?,
            }
        }
    }

    fn release_all(&self, txn_id: u64, keys: &HashSet<Vec<u8>>) {
        if keys.is_empty() {
            return;
        }
        if let Ok(mut owners) = self.owners.lock() {
            for key in keys {
                if owners.get(key) == Some(&txn_id) {
                    owners.remove(key);
                }
            }
        }
        self.released.notify_all();
    }
}

/// Issues transaction ids and tracks the live transactions.
///
/// Holds only a weak reference back to the engine: the engine owns the
/// manager, and transactions themselves keep the engine alive while they
/// run.
pub struct TransactionManager {
    engine: Weak<EngineInner>,
    next_id: AtomicU64,
    active: Mutex<HashSet<u64>>,
    locks: KeyLockRegistry,
}

impl TransactionManager {
    pub(crate) fn new(engine: Weak<EngineInner>) -> Self {
        Self {
            engine,
            next_id: AtomicU64::new(0),
            active: Mutex::new(HashSet::new()),
            locks: KeyLockRegistry::new(),
        }
    }

    /// Starts a new transaction.
    pub(crate) fn begin(&self) -> Result<Transaction> {
        let engine = self.engine.upgrade().ok_or(Error::Closed)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.lock()?.insert(id);
        tracing::debug!(txn = id, "Transaction started");
        Ok(Transaction {
            id,
            start_timestamp: wall_millis(),
            engine,
            read_set: HashMap::new(),
            write_set: BTreeMap::new(),
            delete_set: BTreeSet::new(),
            locked_keys: HashSet::new(),
            active: true,
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    fn finish(&self, txn_id: u64, locked: &HashSet<Vec<u8>>) {
        self.locks.release_all(txn_id, locked);
        if let Ok(mut active) = self.active.lock() {
            active.remove(&txn_id);
        }
    }
}

/// A single transaction. Mutations are buffered until `commit`; `rollback`
/// (explicit or on drop) discards them.
pub struct Transaction {
    id: u64,
    start_timestamp: u64,
    engine: Arc<EngineInner>,
    /// Observed engine state, including observed absence.
    read_set: HashMap<Vec<u8>, Option<Vec<u8>>>,
    /// Pending writes, kept ordered for a deterministic apply.
    write_set: BTreeMap<Vec<u8>, Vec<u8>>,
    delete_set: BTreeSet<Vec<u8>>,
    locked_keys: HashSet<Vec<u8>>,
    active: bool,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn start_timestamp(&self) -> u64 {
        self.start_timestamp
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Reads through the transaction's own buffered state first, then the
    /// engine, recording what was observed.
    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_active()?;
        let key = key.as_bytes();

        if let Some(value) = self.write_set.get(key) {
            return Ok(Some(value.clone()));
        }
        if self.delete_set.contains(key) {
            return Ok(None);
        }

        let value = self.engine.get_bytes(key)?;
        self.read_set.insert(key.to_vec(), value.clone());
        Ok(value)
    }

    /// Buffers a write, locking the key for the transaction's lifetime.
    pub fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.ensure_active()?;
        crate::engine::validate_key(key.as_bytes())?;
        crate::engine::validate_value(value)?;
        let key = key.as_bytes();

        self.lock_key(key)?;
        self.write_set.insert(key.to_vec(), value.to_vec());
        self.delete_set.remove(key);
        Ok(())
    }

    /// Buffers a deletion, locking the key for the transaction's lifetime.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.ensure_active()?;
        crate::engine::validate_key(key.as_bytes())?;
        let key = key.as_bytes();

        self.lock_key(key)?;
        self.delete_set.insert(key.to_vec());
        self.write_set.remove(key);
        Ok(())
    }

    /// Validates the read set against current committed state, then applies
    /// the buffered writes and deletes in key order.
    ///
    /// On a validation mismatch the transaction is rolled back and
    /// `Error::Conflict` is returned.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;

        let mut conflict = None;
        for (key, expected) in &self.read_set {
            let actual = self.engine.get_bytes(key)?;
            if actual != *expected {
                conflict = Some(String::from_utf8_lossy(key).into_owned());
                break;
            }
        }
        if let Some(key) = conflict {
            self.finish();
            tracing::debug!(txn = self.id, key = %key, "Transaction aborted on conflict");
            return Err(Error::Conflict(format!(
                "read set validation failed for key {key}"
            )));
        }

        let apply = (|| -> Result<()> {
            for (key, value) in &self.write_set {
                self.engine.put_bytes(key, value)?;
            }
            for key in &self.delete_set {
                self.engine.delete_bytes(key)?;
            }
            Ok(())
        })();
        if let Err(e) = apply {
            self.finish();
            return Err(e);
        }

        self.finish();
        tracing::debug!(txn = self.id, "Transaction committed");
        Ok(())
    }

    /// Discards buffered state and releases all locks. Idempotent.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.finish();
        tracing::debug!(txn = self.id, "Transaction rolled back");
        Ok(())
    }

    fn lock_key(&mut self, key: &[u8]) -> Result<()> {
        if self.locked_keys.contains(key) {
            return Ok(());
        }
        self.engine.txns().locks.acquire(key, self.id)?;
        self.locked_keys.insert(key.to_vec());
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if !self.active {
            return Err(Error::InvalidState(
                "transaction is not active".to_string(),
            ));
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.engine.txns().finish(self.id, &self.locked_keys);
        self.locked_keys.clear();
        self.write_set.clear();
        self.delete_set.clear();
        self.read_set.clear();
        self.active = false;
    }
}

impl Drop for Transaction {
    // A dropped transaction must not leave keys locked.
    fn drop(&mut self) {
        if self.active {
            self.finish();
        }
    }
}
