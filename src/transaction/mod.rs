//! ACID transaction support: types, locking, deadlock detection, isolation
//! validation, and the orchestrating manager (components D–H).

pub mod deadlock;
pub mod isolation;
pub mod lock_manager;
pub mod manager;
pub mod types;

pub use deadlock::{DeadlockDetector, DeadlockDetectorConfig, VictimSelectionPolicy};
pub use isolation::IsolationValidator;
pub use lock_manager::LockManager;
pub use manager::{BeginOptions, TransactionManager, TransactionManagerConfig, TransactionStats};
pub use types::{IsolationLevel, LockMode, Operation, OperationType, Transaction, TransactionState};
