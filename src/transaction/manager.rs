//! Transaction lifecycle orchestration: the active-transaction table and
//! `begin`/`commit`/`abort`, coordinating the lock manager, isolation
//! validator, and deadlock detector rather than only tracking state.
//!
//! Transactions apply their writes to the shared store optimistically as
//! they happen (`Database::set` calls [`TransactionManager::record_write`]
//! and then performs the mutation itself); `commit` acquires exclusive
//! locks on the write set and validates isolation, and `abort` hands back
//! the transaction's `rollback_operations()` for the caller to re-apply.
//! This keeps `TransactionManager` itself free of a `RecordStore`
//! dependency: it coordinates locking, isolation, and deadlock
//! detection without owning storage.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::TransactionId;
use crate::error::{Result, StoreError};
use crate::record::Record;
use crate::transaction::deadlock::DeadlockDetector;
use crate::transaction::isolation::IsolationValidator;
use crate::transaction::lock_manager::LockManager;
use crate::transaction::types::{IsolationLevel, Operation, OperationType, Transaction, TransactionState};

#[derive(Debug, Clone)]
pub struct BeginOptions {
    pub isolation_level: IsolationLevel,
    pub read_only: bool,
    pub timeout_ms: u64,
}

impl Default for BeginOptions {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::default(),
            read_only: false,
            timeout_ms: 0,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct TransactionStats {
    pub begun: u64,
    pub committed: u64,
    pub aborted: u64,
}

#[derive(Debug)]
pub struct TransactionManagerConfig {
    pub lock_timeout: Duration,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Owns the active-transaction table and coordinates [`LockManager`],
/// [`IsolationValidator`], and [`DeadlockDetector`] around `begin`/
/// `commit`/`abort`.
#[derive(Debug)]
pub struct TransactionManager {
    txns: DashMap<TransactionId, Transaction>,
    lock_manager: Arc<LockManager>,
    isolation: Arc<IsolationValidator>,
    deadlock: Arc<DeadlockDetector>,
    config: TransactionManagerConfig,
    stats: Mutex<TransactionStats>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>, isolation: Arc<IsolationValidator>, deadlock: Arc<DeadlockDetector>) -> Self {
        Self::with_config(lock_manager, isolation, deadlock, TransactionManagerConfig::default())
    }

    pub fn with_config(
        lock_manager: Arc<LockManager>,
        isolation: Arc<IsolationValidator>,
        deadlock: Arc<DeadlockDetector>,
        config: TransactionManagerConfig,
    ) -> Self {
        Self {
            txns: DashMap::new(),
            lock_manager,
            isolation,
            deadlock,
            config,
            stats: Mutex::new(TransactionStats::default()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn begin(&self, opts: BeginOptions) -> TransactionId {
        let id = crate::common::generate_transaction_id();
        let mut txn = Transaction::new(id, opts.isolation_level, opts.read_only, opts.timeout_ms);
        txn.activate();
        self.deadlock.record_start(id, txn.start_time);
        self.txns.insert(id, txn);
        self.stats.lock().begun += 1;
        debug!(transaction_id = %id, isolation = ?opts.isolation_level, read_only = opts.read_only, "transaction begin");
        id
    }

    pub fn get(&self, id: TransactionId) -> Option<Transaction> {
        self.txns.get(&id).map(|t| t.clone())
    }

    pub fn is_active(&self, id: TransactionId) -> bool {
        self.txns.get(&id).map(|t| t.state == TransactionState::Active).unwrap_or(false)
    }

    pub fn record_read(&self, id: TransactionId, key: &str, value: Option<Record>) -> Result<()> {
        let mut entry = self.txns.get_mut(&id).ok_or_else(|| StoreError::not_found(id.to_string()))?;
        entry.record_read(key, value)
    }

    pub fn record_write(
        &self,
        id: TransactionId,
        op_type: OperationType,
        key: &str,
        old: Option<Record>,
        new: Option<Record>,
        metadata: Option<String>,
    ) -> Result<()> {
        let mut entry = self.txns.get_mut(&id).ok_or_else(|| StoreError::not_found(id.to_string()))?;
        entry.record_write(op_type, key, old, new, metadata)
    }

    /// Runs every deadlock-detection strategy
    /// ([`DeadlockDetector::run_all_detections`]) and aborts a victim out of
    /// each newly-found group, returning the aborted ids alongside the
    /// rollback operations the caller must re-apply. The store façade
    /// drives this before every commit (so a transaction about to take
    /// locks first clears any deadlock it is a party to) and may also run
    /// it periodically.
    pub fn run_deadlock_detection(&self) -> Vec<(TransactionId, Vec<Operation>)> {
        let active: Vec<Transaction> = self
            .txns
            .iter()
            .filter(|e| e.value().state == TransactionState::Active)
            .map(|e| e.value().clone())
            .collect();
        let active_refs: Vec<&Transaction> = active.iter().collect();
        let suspected = self.isolation.suspected_conflicts(&active_refs);
        let groups = self.deadlock.run_all_detections(&self.lock_manager, &suspected);

        let mut aborted = Vec::new();
        for group in groups {
            if group.is_empty() {
                continue;
            }
            let victim = self.deadlock.select_victim(&group);
            warn!(victim = %victim, group_size = group.len(), "deadlock detection run selected a victim");
            let still_active = self.txns.get(&victim).map(|t| !t.state.is_terminal()).unwrap_or(false);
            if still_active {
                self.lock_manager.release_all(victim);
                let rollback = self.finalize_abort(victim);
                self.deadlock.record_victim_aborted();
                aborted.push((victim, rollback));
            }
        }
        aborted
    }

    /// Acquires exclusive locks on the write set, validates isolation, and
    /// marks the transaction committed. On any failure the transaction is
    /// finalized as aborted and its rollback operations are returned
    /// alongside the error so the caller can undo the optimistic writes it
    /// already applied. Deadlock detection is the caller's concern
    /// ([`Self::run_deadlock_detection`]): only the caller can undo a
    /// victim's writes, so the sweep must run where the store is in reach.
    pub fn commit(&self, id: TransactionId) -> std::result::Result<(), (StoreError, Vec<Operation>)> {
        let write_keys: Vec<String> = match self.txns.get(&id) {
            Some(t) if t.state == TransactionState::Active => t.write_set.iter().cloned().collect(),
            Some(t) if t.state.is_terminal() => return Ok(()),
            _ => return Err((StoreError::not_found(id.to_string()), Vec::new())),
        };

        let mut acquired = Vec::new();
        for key in &write_keys {
            match self.lock_manager.acquire(id, key, crate::transaction::types::LockMode::Exclusive, self.config.lock_timeout) {
                Ok(()) => acquired.push(key.clone()),
                Err(e) => {
                    for held in &acquired {
                        self.lock_manager.release(id, held);
                    }
                    let rollback = self.finalize_abort(id);
                    return Err((e, rollback));
                }
            }
        }

        let others: Vec<Transaction> = self
            .txns
            .iter()
            .filter(|e| *e.key() != id)
            .map(|e| e.value().clone())
            .collect();
        let others_refs: Vec<&Transaction> = others.iter().collect();

        let txn_snapshot = self.txns.get(&id).map(|t| t.clone());
        let validation = match &txn_snapshot {
            Some(t) => self.isolation.validate(t, &others_refs),
            None => Err(StoreError::not_found(id.to_string())),
        };

        match validation {
            Ok(()) => {
                if let Some(mut entry) = self.txns.get_mut(&id) {
                    entry.finish(TransactionState::Committed);
                }
                self.isolation.record_commit(id, write_keys);
                self.lock_manager.release_all(id);
                self.deadlock.remove_wait(id);
                self.stats.lock().committed += 1;
                debug!(transaction_id = %id, "transaction commit");
                Ok(())
            }
            Err(e) => {
                self.lock_manager.release_all(id);
                let rollback = self.finalize_abort(id);
                warn!(transaction_id = %id, error = %e, "transaction commit failed isolation validation, aborting");
                Err((e, rollback))
            }
        }
    }

    /// Idempotent on already-terminal transactions. Returns the rollback
    /// operations the caller must apply to undo this transaction's
    /// optimistic writes.
    pub fn abort(&self, id: TransactionId, reason: impl Into<String>) -> Result<Vec<Operation>> {
        let reason = reason.into();
        match self.txns.get(&id) {
            Some(t) if t.state.is_terminal() => Ok(Vec::new()),
            Some(_) => {
                self.lock_manager.release_all(id);
                debug!(transaction_id = %id, reason = %reason, "transaction abort");
                Ok(self.finalize_abort(id))
            }
            None => Err(StoreError::not_found(id.to_string())),
        }
    }

    fn finalize_abort(&self, id: TransactionId) -> Vec<Operation> {
        let rollback = self
            .txns
            .get(&id)
            .map(|t| t.rollback_operations())
            .unwrap_or_default();
        if let Some(mut entry) = self.txns.get_mut(&id) {
            if !entry.state.is_terminal() {
                entry.finish(TransactionState::Aborted);
            }
        }
        self.deadlock.remove_wait(id);
        self.stats.lock().aborted += 1;
        rollback
    }

    pub fn statistics(&self) -> TransactionStats {
        self.stats.lock().clone()
    }

    pub fn active_count(&self) -> usize {
        self.txns.iter().filter(|e| e.value().state == TransactionState::Active).count()
    }

    pub fn active_ids(&self) -> Vec<TransactionId> {
        self.txns
            .iter()
            .filter(|e| e.value().state == TransactionState::Active)
            .map(|e| *e.key())
            .collect()
    }

    /// Evicts terminal transactions older than `max_age`, bounding the
    /// active-transaction table's growth.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = SystemTime::now();
        let stale: Vec<TransactionId> = self
            .txns
            .iter()
            .filter(|e| {
                e.value().state.is_terminal()
                    && e.value()
                        .end_time
                        .map(|end| now.duration_since(end).unwrap_or(Duration::ZERO) > max_age)
                        .unwrap_or(false)
            })
            .map(|e| *e.key())
            .collect();
        for id in &stale {
            self.txns.remove(id);
        }
        stale.len()
    }

    pub fn check_timeouts(&self) -> Vec<TransactionId> {
        self.txns
            .iter()
            .filter(|e| e.value().state == TransactionState::Active && e.value().is_timed_out())
            .map(|e| *e.key())
            .collect()
    }
}
