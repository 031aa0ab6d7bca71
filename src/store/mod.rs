//! The ordered key→record map at the base of the store.
//!
//! Iteration order matches insertion order of the keys currently present,
//! which is why the map is `indexmap::IndexMap` rather than
//! `std::collections::HashMap`: a plain hash map's iteration order is
//! unspecified and `BTreeMap` would reorder by key instead of by
//! insertion.

use crate::common::RecordKey;
use crate::record::Record;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// The base record map. Every read returns a reference-counted, immutable
/// snapshot of the stored record (`Arc<Record>`). A shared `Arc` cannot
/// be mutated through, so this layer needs no separate "immutable mode"
/// code path; the immutable-mode contract is satisfied unconditionally.
/// See `db.rs` for how the `immutable` store option is surfaced to
/// callers.
#[derive(Debug)]
pub struct RecordStore {
    map: RwLock<IndexMap<RecordKey, Arc<Record>>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(IndexMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Record>> {
        self.map.read().get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.map.read().contains_key(key)
    }

    /// Inserts or overwrites `key`, returning the prior value if one
    /// existed. Overwriting an existing key preserves its position in
    /// iteration order (it does not move to the end).
    pub fn set(&self, key: RecordKey, record: Record) -> Option<Arc<Record>> {
        let mut map = self.map.write();
        map.insert(key, Arc::new(record))
    }

    /// Removes `key`, returning the removed value. Preserves the relative
    /// order of the remaining keys (`shift_remove`, not `swap_remove`).
    pub fn delete(&self, key: &str) -> Option<Arc<Record>> {
        self.map.write().shift_remove(key)
    }

    pub fn size(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn keys(&self) -> Vec<RecordKey> {
        self.map.read().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(RecordKey, Arc<Record>)> {
        self.map.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}
