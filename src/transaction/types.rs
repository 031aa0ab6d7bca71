//! Core transaction types and domain models.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut txn = Transaction::new(TransactionId::new_v4(), IsolationLevel::ReadCommitted);
//! txn.activate();
//! assert_eq!(txn.state, TransactionState::Active);
//! ```

use crate::common::TransactionId;
use crate::error::{Result, StoreError, TransactionErrorKind};
use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

/// Isolation level for transactions, weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

/// Transaction lifecycle state.
///
/// ```text
/// Pending -> Active -> Committed
///                   -> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Pending,
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

/// Lock mode requested/held on a resource. See `transaction::lock_manager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn is_compatible(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Shared => write!(f, "SHARED"),
            LockMode::Exclusive => write!(f, "EXCLUSIVE"),
        }
    }
}

/// Kind of operation recorded in a transaction's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Read,
    Set,
    Delete,
}

/// One entry in a transaction's operation log. `metadata` is an opaque
/// caller tag (the façade marks operations that arrived via `batch`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub op_type: OperationType,
    pub key: String,
    pub old_value: Option<Record>,
    pub new_value: Option<Record>,
    pub metadata: Option<String>,
    pub timestamp: SystemTime,
}

/// An active (or terminal) unit of work over the record store.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub isolation_level: IsolationLevel,
    pub read_only: bool,
    pub timeout_ms: u64,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub state: TransactionState,
    pub operations: Vec<Operation>,
    pub read_set: HashSet<String>,
    pub write_set: HashSet<String>,
    /// Values observed by reads, populated under REPEATABLE_READ/SERIALIZABLE.
    pub snapshot: HashMap<String, Option<Record>>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation_level: IsolationLevel, read_only: bool, timeout_ms: u64) -> Self {
        Self {
            id,
            isolation_level,
            read_only,
            timeout_ms,
            start_time: SystemTime::now(),
            end_time: None,
            state: TransactionState::Pending,
            operations: Vec::new(),
            read_set: HashSet::new(),
            write_set: HashSet::new(),
            snapshot: HashMap::new(),
        }
    }

    pub fn activate(&mut self) {
        self.state = TransactionState::Active;
    }

    pub fn is_timed_out(&self) -> bool {
        self.timeout_ms > 0
            && SystemTime::now()
                .duration_since(self.start_time)
                .unwrap_or(Duration::ZERO)
                .as_millis() as u64
                > self.timeout_ms
    }

    /// Records a read, filling the snapshot for levels that require one.
    pub fn record_read(&mut self, key: &str, value: Option<Record>) -> Result<()> {
        self.check_open()?;
        self.read_set.insert(key.to_string());
        if matches!(self.isolation_level, IsolationLevel::RepeatableRead | IsolationLevel::Serializable) {
            self.snapshot.entry(key.to_string()).or_insert_with(|| value.clone());
        }
        self.operations.push(Operation {
            op_type: OperationType::Read,
            key: key.to_string(),
            old_value: None,
            new_value: value,
            metadata: None,
            timestamp: SystemTime::now(),
        });
        Ok(())
    }

    /// Records a write. Rejected when the transaction is read-only or
    /// timed out.
    pub fn record_write(
        &mut self,
        op_type: OperationType,
        key: &str,
        old_value: Option<Record>,
        new_value: Option<Record>,
        metadata: Option<String>,
    ) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(StoreError::transaction(
                TransactionErrorKind::ReadOnly,
                key,
                format!("transaction {} is read-only", self.id),
            ));
        }
        self.write_set.insert(key.to_string());
        self.operations.push(Operation {
            op_type,
            key: key.to_string(),
            old_value,
            new_value,
            metadata,
            timestamp: SystemTime::now(),
        });
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(StoreError::transaction(
                TransactionErrorKind::WrongState,
                self.id.to_string(),
                format!("transaction is already {:?}", self.state),
            ));
        }
        if self.is_timed_out() {
            return Err(StoreError::transaction(
                TransactionErrorKind::Timeout,
                self.id.to_string(),
                format!("transaction exceeded its {}ms timeout", self.timeout_ms),
            ));
        }
        Ok(())
    }

    /// Returns the operation log reversed, each write inverted: a `Set`
    /// with no prior value becomes a `Delete`; a `Set` with a prior value
    /// becomes a `Set` back to it; a `Delete` becomes a `Set` back to the
    /// value it deleted. Reads are skipped.
    pub fn rollback_operations(&self) -> Vec<Operation> {
        self.operations
            .iter()
            .rev()
            .filter(|op| op.op_type != OperationType::Read)
            .map(|op| match op.op_type {
                OperationType::Set => match &op.old_value {
                    None => Operation {
                        op_type: OperationType::Delete,
                        key: op.key.clone(),
                        old_value: op.new_value.clone(),
                        new_value: None,
                        metadata: None,
                        timestamp: SystemTime::now(),
                    },
                    Some(old) => Operation {
                        op_type: OperationType::Set,
                        key: op.key.clone(),
                        old_value: op.new_value.clone(),
                        new_value: Some(old.clone()),
                        metadata: None,
                        timestamp: SystemTime::now(),
                    },
                },
                OperationType::Delete => Operation {
                    op_type: OperationType::Set,
                    key: op.key.clone(),
                    old_value: None,
                    new_value: op.old_value.clone(),
                    metadata: None,
                    timestamp: SystemTime::now(),
                },
                OperationType::Read => unreachable!("filtered above"),
            })
            .collect()
    }

    pub fn finish(&mut self, state: TransactionState) {
        self.state = state;
        self.end_time = Some(SystemTime::now());
    }
}
