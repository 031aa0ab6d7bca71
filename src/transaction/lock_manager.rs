//! The lock manager: a resource → holders table and a transaction →
//! held-resources index, backed by a wait-queue/condition-variable retry
//! loop rather than busy-spinning. Keyed by `Uuid` transaction ids, with
//! a two-outcome `try_acquire` (granted/would-block, plus upgrade).
//!
//! # Example
//!
//! ```rust,ignore
//! let lm = LockManager::new();
//! lm.acquire(txn_id, "r1", LockMode::Exclusive, Duration::from_secs(1))?;
//! lm.release_all(txn_id);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::common::TransactionId;
use crate::error::{Result, StoreError};
use crate::transaction::types::LockMode;

/// Current holders and a FIFO wait queue for one resource.
#[derive(Debug, Default)]
struct LockTableEntry {
    holders: Vec<(TransactionId, LockMode)>,
    waiters: VecDeque<TransactionId>,
}

/// Outcome of a non-blocking acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryAcquireOutcome {
    Granted,
    Upgraded,
    WouldBlock,
}

/// Per-resource shared/exclusive lock manager with a blocking, timed
/// `acquire`.
#[derive(Debug)]
pub struct LockManager {
    table: Arc<RwLock<HashMap<String, LockTableEntry>>>,
    held_by: Arc<RwLock<HashMap<TransactionId, HashSet<String>>>>,
    wait_condvar: Arc<Condvar>,
    wait_gate: Arc<Mutex<()>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(HashMap::new())),
            held_by: Arc::new(RwLock::new(HashMap::new())),
            wait_condvar: Arc::new(Condvar::new()),
            wait_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Single non-blocking acquisition attempt: shared/shared locks are
    /// compatible, a lone shared holder may upgrade to exclusive, and
    /// anything else queues the caller as a waiter.
    pub fn try_acquire(&self, txn: TransactionId, key: &str, mode: LockMode) -> TryAcquireOutcome {
        let mut table = self.table.write();
        let entry = table.entry(key.to_string()).or_default();

        if entry.holders.is_empty() {
            entry.holders.push((txn, mode));
            drop(table);
            self.held_by.write().entry(txn).or_default().insert(key.to_string());
            return TryAcquireOutcome::Granted;
        }

        if let Some(pos) = entry.holders.iter().position(|(id, _)| *id == txn) {
            let current = entry.holders[pos].1;
            if mode == LockMode::Exclusive && current == LockMode::Shared && entry.holders.len() == 1 {
                entry.holders[pos].1 = LockMode::Exclusive;
                return TryAcquireOutcome::Upgraded;
            }
            // Already compatible with itself (same or weaker mode already held).
            return TryAcquireOutcome::Granted;
        }

        if entry.holders.iter().all(|(_, held)| mode.is_compatible(held)) {
            entry.holders.push((txn, mode));
            drop(table);
            self.held_by.write().entry(txn).or_default().insert(key.to_string());
            return TryAcquireOutcome::Granted;
        }

        if !entry.waiters.contains(&txn) {
            entry.waiters.push_back(txn);
        }
        TryAcquireOutcome::WouldBlock
    }

    /// Retries `try_acquire` until it succeeds or `timeout` elapses,
    /// parking on a condition variable between attempts rather than
    /// busy-spinning.
    pub fn acquire(&self, txn: TransactionId, key: &str, mode: LockMode, timeout: Duration) -> Result<()> {
        let deadline = SystemTime::now() + timeout;
        loop {
            match self.try_acquire(txn, key, mode) {
                TryAcquireOutcome::Granted | TryAcquireOutcome::Upgraded => {
                    self.remove_waiter(key, txn);
                    return Ok(());
                }
                TryAcquireOutcome::WouldBlock => {}
            }

            let remaining = deadline.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                self.remove_waiter(key, txn);
                return Err(StoreError::concurrency(
                    key,
                    format!("transaction {} timed out waiting for a {} lock", txn, mode),
                ));
            }

            let mut gate = self.wait_gate.lock();
            self.wait_condvar.wait_for(&mut gate, remaining.min(Duration::from_millis(25)));
        }
    }

    fn remove_waiter(&self, key: &str, txn: TransactionId) {
        if let Some(entry) = self.table.write().get_mut(key) {
            entry.waiters.retain(|id| *id != txn);
        }
    }

    pub fn release(&self, txn: TransactionId, key: &str) {
        let mut table = self.table.write();
        let mut drop_entry = false;
        if let Some(entry) = table.get_mut(key) {
            entry.holders.retain(|(id, _)| *id != txn);
            drop_entry = entry.holders.is_empty() && entry.waiters.is_empty();
        }
        if drop_entry {
            table.remove(key);
        }
        drop(table);
        if let Some(keys) = self.held_by.write().get_mut(&txn) {
            keys.remove(key);
        }
        self.wait_condvar.notify_all();
    }

    pub fn release_all(&self, txn: TransactionId) {
        let keys: Vec<String> = self
            .held_by
            .write()
            .remove(&txn)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        let mut table = self.table.write();
        for key in &keys {
            if let Some(entry) = table.get_mut(key) {
                entry.holders.retain(|(id, _)| *id != txn);
                if entry.holders.is_empty() && entry.waiters.is_empty() {
                    table.remove(key);
                }
            }
        }
        drop(table);
        self.wait_condvar.notify_all();
    }

    pub fn holders_of(&self, key: &str) -> Vec<(TransactionId, LockMode)> {
        self.table.read().get(key).map(|e| e.holders.clone()).unwrap_or_default()
    }

    pub fn locks_held_by(&self, txn: TransactionId) -> HashSet<String> {
        self.held_by.read().get(&txn).cloned().unwrap_or_default()
    }

    /// `(waiting_txn, key, holders_of_key)` triples, the raw material for
    /// the deadlock detector's wait-for graph.
    pub fn waiters(&self) -> Vec<(TransactionId, String, Vec<TransactionId>)> {
        self.table
            .read()
            .iter()
            .flat_map(|(key, entry)| {
                let holders: Vec<TransactionId> = entry.holders.iter().map(|(id, _)| *id).collect();
                entry.waiters.iter().map(move |w| (*w, key.clone(), holders.clone()))
            })
            .collect()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
