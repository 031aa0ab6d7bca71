//! Shared identifiers and small helpers used across all subsystems.

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Identifier for a stored record's primary key.
pub type RecordKey = String;

/// Identifier for a named index.
pub type IndexName = String;

/// A transaction identifier, a fresh v4 UUID per `begin`.
pub type TransactionId = Uuid;

/// Generates a fresh record key when the caller does not supply one.
pub fn generate_record_key() -> RecordKey {
    Uuid::new_v4().to_string()
}

/// Generates a fresh transaction id.
pub fn generate_transaction_id() -> TransactionId {
    Uuid::new_v4()
}

/// Milliseconds since the Unix epoch, used for version timestamps and
/// retention-policy arithmetic. Saturates to zero if the clock is before
/// the epoch, which should never happen outside of test doubles.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
