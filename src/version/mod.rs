//! Per-key version history with pluggable retention.
//!
//! An append-then-trim idiom for bounded collections (retention-by-count
//! for a per-key history), generalized to four retention policies: keep
//! nothing, keep everything, keep the most recent N, or keep everything
//! within an age window.

use crate::common::{now_millis, RecordKey};
use crate::record::Record;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::collections::HashMap;
use std::time::Duration;

/// How a key's version history is pruned after every append.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetentionPolicy {
    /// Keep only the most recent `max_count` entries.
    Count(usize),
    /// Drop entries older than `max_age`.
    Time(Duration),
    /// Drop the oldest entries until the total serialized size is within
    /// `max_bytes`.
    Size(usize),
    /// Never prune.
    None,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::None
    }
}

/// Tag describing which operation produced a version entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationTag {
    Create,
    Update,
    Delete,
}

/// An immutable prior state of a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionEntry {
    pub data: Record,
    pub timestamp_millis: u64,
    pub size: usize,
    pub operation: OperationTag,
}

impl VersionEntry {
    fn new(data: Record, operation: OperationTag) -> Self {
        let size = serde_json::to_vec(&data).map(|b| b.len()).unwrap_or(0);
        Self {
            data,
            timestamp_millis: now_millis(),
            size,
            operation,
        }
    }
}

/// The ordered history of prior states for a single key.
#[derive(Debug, Clone)]
pub struct VersionHistory {
    entries: VecDeque<VersionEntry>,
    policy: RetentionPolicy,
}

impl VersionHistory {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            policy,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, entry: VersionEntry) {
        self.entries.push_back(entry);
        self.apply_retention();
    }

    fn apply_retention(&mut self) {
        match self.policy {
            RetentionPolicy::Count(max) => {
                while self.entries.len() > max {
                    self.entries.pop_front();
                }
            }
            RetentionPolicy::Time(max_age) => {
                let cutoff = now_millis().saturating_sub(max_age.as_millis() as u64);
                while matches!(self.entries.front(), Some(e) if e.timestamp_millis < cutoff) {
                    self.entries.pop_front();
                }
            }
            RetentionPolicy::Size(max_bytes) => {
                let mut total: usize = self.entries.iter().map(|e| e.size).sum();
                while total > max_bytes {
                    if let Some(evicted) = self.entries.pop_front() {
                        total -= evicted.size;
                    } else {
                        break;
                    }
                }
            }
            RetentionPolicy::None => {}
        }
    }

    /// `index` counts from the oldest entry (0); negative indexes count
    /// from the newest (`-1` is the most recent entry).
    pub fn get(&self, index: i64) -> Option<&VersionEntry> {
        if index >= 0 {
            self.entries.get(index as usize)
        } else {
            let offset = (-index) as usize;
            if offset > self.entries.len() {
                None
            } else {
                self.entries.get(self.entries.len() - offset)
            }
        }
    }

    pub fn latest(&self) -> Option<&VersionEntry> {
        self.entries.back()
    }

    pub fn oldest(&self) -> Option<&VersionEntry> {
        self.entries.front()
    }

    pub fn range(&self, start: Option<usize>, end: Option<usize>) -> Vec<&VersionEntry> {
        let start = start.unwrap_or(0);
        let end = end.unwrap_or(self.entries.len()).min(self.entries.len());
        if start >= end {
            return Vec::new();
        }
        self.entries.iter().skip(start).take(end - start).collect()
    }

    pub fn remove_older_than(&mut self, max_age: Duration) {
        let cutoff = now_millis().saturating_sub(max_age.as_millis() as u64);
        self.entries.retain(|e| e.timestamp_millis >= cutoff);
    }
}

/// Owns every key's version history.
#[derive(Debug)]
pub struct VersionManager {
    default_policy: RetentionPolicy,
    histories: RwLock<HashMap<RecordKey, VersionHistory>>,
}

impl VersionManager {
    pub fn new(default_policy: RetentionPolicy) -> Self {
        Self {
            default_policy,
            histories: RwLock::new(HashMap::new()),
        }
    }

    /// Enables versioning for `key`, creating an empty history if absent.
    pub fn enable(&self, key: &RecordKey, policy: Option<RetentionPolicy>) {
        let mut histories = self.histories.write();
        histories
            .entry(key.clone())
            .or_insert_with(|| VersionHistory::new(policy.unwrap_or(self.default_policy)));
    }

    pub fn disable(&self, key: &str) {
        self.histories.write().remove(key);
    }

    pub fn is_enabled(&self, key: &str) -> bool {
        self.histories.read().contains_key(key)
    }

    pub fn add_version(&self, key: &RecordKey, data: Record, operation: OperationTag) {
        let mut histories = self.histories.write();
        if let Some(history) = histories.get_mut(key) {
            history.push(VersionEntry::new(data, operation));
        }
    }

    pub fn get_version(&self, key: &str, index: i64) -> Option<VersionEntry> {
        self.histories.read().get(key).and_then(|h| h.get(index).cloned())
    }

    pub fn latest(&self, key: &str) -> Option<VersionEntry> {
        self.histories.read().get(key).and_then(|h| h.latest().cloned())
    }

    pub fn oldest(&self, key: &str) -> Option<VersionEntry> {
        self.histories.read().get(key).and_then(|h| h.oldest().cloned())
    }

    pub fn versions_in_range(&self, key: &str, start: Option<usize>, end: Option<usize>) -> Vec<VersionEntry> {
        self.histories
            .read()
            .get(key)
            .map(|h| h.range(start, end).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn history_len(&self, key: &str) -> usize {
        self.histories.read().get(key).map(|h| h.len()).unwrap_or(0)
    }

    pub fn remove_older_than(&self, max_age: Duration) {
        let mut histories = self.histories.write();
        for history in histories.values_mut() {
            history.remove_older_than(max_age);
        }
    }

    /// Dumps every key's history for persistence elsewhere.
    pub fn export(&self) -> HashMap<RecordKey, Vec<VersionEntry>> {
        self.histories
            .read()
            .iter()
            .map(|(k, h)| (k.clone(), h.entries.iter().cloned().collect()))
            .collect()
    }

    /// Restores histories from a prior `export`. When `merge` is false,
    /// existing histories are replaced wholesale; when true, incoming
    /// entries are appended (and retention re-applied).
    pub fn import(&self, dump: HashMap<RecordKey, Vec<VersionEntry>>, merge: bool) {
        let mut histories = self.histories.write();
        for (key, entries) in dump {
            if merge {
                let history = histories
                    .entry(key)
                    .or_insert_with(|| VersionHistory::new(self.default_policy));
                for e in entries {
                    history.push(e);
                }
            } else {
                let mut history = VersionHistory::new(self.default_policy);
                history.entries = entries.into();
                histories.insert(key, history);
            }
        }
    }

    pub fn clear(&self) {
        self.histories.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn rec(v: i64) -> Record {
        let mut r = Record::new();
        r.set("v", Value::Int(v));
        r
    }

    #[test]
    fn s4_count_retention_keeps_last_n_preimages() {
        let vm = VersionManager::new(RetentionPolicy::None);
        let key = "r1".to_string();
        vm.enable(&key, Some(RetentionPolicy::Count(3)));

        for v in 0..5 {
            vm.add_version(&key, rec(v), OperationTag::Update);
        }

        assert_eq!(vm.history_len(&key), 3);
        let kept: Vec<i64> = vm
            .versions_in_range(&key, None, None)
            .iter()
            .map(|e| match e.data.get("v") {
                Some(Value::Int(i)) => *i,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(kept, vec![2, 3, 4]);
    }

    #[test]
    fn negative_index_counts_from_newest() {
        let vm = VersionManager::new(RetentionPolicy::None);
        let key = "r1".to_string();
        vm.enable(&key, None);
        vm.add_version(&key, rec(1), OperationTag::Create);
        vm.add_version(&key, rec(2), OperationTag::Update);

        let latest = vm.get_version(&key, -1).unwrap();
        assert_eq!(latest.data.get("v"), Some(&Value::Int(2)));
    }

    #[test]
    fn export_import_round_trip_preserves_timestamps() {
        let vm = VersionManager::new(RetentionPolicy::None);
        let key = "r1".to_string();
        vm.enable(&key, None);
        vm.add_version(&key, rec(1), OperationTag::Create);

        let dump = vm.export();
        let fresh = VersionManager::new(RetentionPolicy::None);
        fresh.import(dump, false);

        let original = vm.latest(&key).unwrap();
        let restored = fresh.latest(&key).unwrap();
        assert_eq!(original.timestamp_millis, restored.timestamp_millis);
        assert_eq!(original.data, restored.data);
    }

    #[test]
    fn disabling_versioning_drops_history() {
        let vm = VersionManager::new(RetentionPolicy::None);
        let key = "r1".to_string();
        vm.enable(&key, None);
        vm.add_version(&key, rec(1), OperationTag::Create);
        vm.disable(&key);
        assert!(!vm.is_enabled(&key));
        assert_eq!(vm.history_len(&key), 0);
    }
}
