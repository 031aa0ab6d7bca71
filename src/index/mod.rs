//! Secondary indexes over the record store.
//!
//! An [`Index`] keeps a reverse mapping from generated index key to the set
//! of record keys that produced it. [`IndexManager`] owns a named
//! collection of indexes and keeps every one of them consistent with the
//! record store under `add`/`remove`/`update`.

use crate::common::RecordKey;
use crate::error::{IndexErrorKind, Result, StoreError};
use crate::record::Record;
use crate::value::Value;
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

pub type FilterFn = dyn Fn(&Record) -> bool + Send + Sync;
pub type TransformFn = dyn Fn(&str) -> String + Send + Sync;

/// The derived classification of an index. `Array` is assigned the first
/// time a record contributes more than one key from a single field; it
/// is advisory metadata, not something that changes how keys are
/// generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    Single,
    Composite,
    Array,
    Partial,
}

/// Declaration used to create an index.
#[derive(Clone)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
    pub filter: Option<Arc<FilterFn>>,
    pub transform: Option<Arc<TransformFn>>,
    pub delimiter: String,
}

impl std::fmt::Debug for IndexSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSpec")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("unique", &self.unique)
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .field("transform", &self.transform.as_ref().map(|_| "<fn>"))
            .field("delimiter", &self.delimiter)
            .finish()
    }
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            fields,
            unique: false,
            filter: None,
            transform: None,
            delimiter: "|".to_string(),
        }
    }

    /// Builds a spec from the shorthand accepted in store configuration:
    /// a bare field name, or several field names joined by `delimiter`
    /// for a composite index. The shorthand string becomes the index
    /// name.
    pub fn from_shorthand(shorthand: &str, delimiter: &str) -> Self {
        let fields = shorthand.split(delimiter).map(str::to_string).collect();
        Self::new(shorthand, fields).delimiter(delimiter)
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn filter(mut self, filter: Arc<FilterFn>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn transform(mut self, transform: Arc<TransformFn>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IndexStats {
    pub total_keys: usize,
    pub total_entries: usize,
    pub estimated_bytes: usize,
}

/// A single named index and its reverse mapping.
pub struct Index {
    name: String,
    sorted_fields: Vec<String>,
    unique: bool,
    filter: Option<Arc<FilterFn>>,
    transform: Option<Arc<TransformFn>>,
    delimiter: String,
    buckets: RwLock<IndexMap<String, IndexSet<RecordKey>>>,
    saw_array_field: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name)
            .field("sorted_fields", &self.sorted_fields)
            .field("unique", &self.unique)
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .field("transform", &self.transform.as_ref().map(|_| "<fn>"))
            .field("delimiter", &self.delimiter)
            .field("buckets", &self.buckets)
            .field("saw_array_field", &self.saw_array_field)
            .finish()
    }
}

impl Index {
    pub fn new(spec: IndexSpec) -> Self {
        let mut sorted_fields = spec.fields.clone();
        sorted_fields.sort();
        Self {
            name: spec.name,
            sorted_fields,
            unique: spec.unique,
            filter: spec.filter,
            transform: spec.transform,
            delimiter: spec.delimiter,
            buckets: RwLock::new(IndexMap::new()),
            saw_array_field: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[String] {
        &self.sorted_fields
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    pub fn kind(&self) -> IndexType {
        if self.filter.is_some() {
            IndexType::Partial
        } else if self.sorted_fields.len() > 1 {
            IndexType::Composite
        } else if self.saw_array_field.load(std::sync::atomic::Ordering::Relaxed) {
            IndexType::Array
        } else {
            IndexType::Single
        }
    }

    /// True if this index's filter (if any) admits `record`, and none of
    /// its fields are null in `record`.
    pub fn admits(&self, record: &Record) -> bool {
        if let Some(filter) = &self.filter {
            if !filter(record) {
                return false;
            }
        }
        self.sorted_fields
            .iter()
            .all(|f| matches!(record.get(f), Some(v) if !v.is_null()))
    }

    /// Generates the set of index keys `record` contributes to this
    /// index. Empty if the record is not admitted (filtered out or a
    /// composite/source field is missing/null).
    pub fn generate_keys(&self, record: &Record) -> Vec<String> {
        if !self.admits(record) {
            return Vec::new();
        }

        let sequences: Vec<Vec<&Value>> = self
            .sorted_fields
            .iter()
            .map(|f| record.get(f).expect("admits() checked presence").as_sequence())
            .collect();

        if sequences.iter().any(|s| s.len() > 1) {
            self.saw_array_field.store(true, std::sync::atomic::Ordering::Relaxed);
        }

        let mut combos: Vec<Vec<&Value>> = vec![Vec::new()];
        for seq in &sequences {
            let mut next = Vec::with_capacity(combos.len() * seq.len());
            for prefix in &combos {
                for value in seq {
                    let mut p = prefix.clone();
                    p.push(*value);
                    next.push(p);
                }
            }
            combos = next;
        }

        let mut keys: Vec<String> = combos
            .into_iter()
            .map(|combo| {
                let joined = combo
                    .iter()
                    .map(|v| v.to_index_string())
                    .collect::<Vec<_>>()
                    .join(&self.delimiter);
                match &self.transform {
                    Some(t) => t(&joined),
                    None => joined,
                }
            })
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    fn would_violate_unique(&self, keys: &[String], record_key: &str) -> Option<String> {
        if !self.unique {
            return None;
        }
        let buckets = self.buckets.read();
        for k in keys {
            if let Some(bucket) = buckets.get(k) {
                if !bucket.is_empty() && !(bucket.len() == 1 && bucket.contains(record_key)) {
                    return Some(k.clone());
                }
            }
        }
        None
    }

    fn apply_keys(&self, record_key: &RecordKey, keys: &[String]) {
        let mut buckets = self.buckets.write();
        for k in keys {
            buckets.entry(k.clone()).or_default().insert(record_key.clone());
        }
    }

    fn retract_keys(&self, record_key: &str, keys: &[String]) {
        let mut buckets = self.buckets.write();
        for k in keys {
            if let Some(bucket) = buckets.get_mut(k) {
                bucket.shift_remove(record_key);
                if bucket.is_empty() {
                    buckets.shift_remove(k);
                }
            }
        }
    }

    pub fn find(&self, index_key: &str) -> IndexSet<RecordKey> {
        self.buckets.read().get(index_key).cloned().unwrap_or_default()
    }

    pub fn clear(&self) {
        self.buckets.write().clear();
        self.saw_array_field.store(false, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn stats(&self) -> IndexStats {
        let buckets = self.buckets.read();
        let total_keys = buckets.len();
        let total_entries: usize = buckets.values().map(|b| b.len()).sum();
        let estimated_bytes = buckets
            .iter()
            .map(|(k, v)| k.len() + v.len() * 24 + 48)
            .sum();
        IndexStats {
            total_keys,
            total_entries,
            estimated_bytes,
        }
    }

    /// Number of distinct keys; used by the optimizer's `est_rows`.
    pub fn cardinality(&self) -> usize {
        self.buckets.read().len()
    }
}

/// Owns every declared index and keeps them consistent with the record
/// store.
#[derive(Debug)]
pub struct IndexManager {
    indexes: RwLock<IndexMap<String, Arc<Index>>>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(IndexMap::new()),
        }
    }

    pub fn create_index(&self, spec: IndexSpec) -> Result<()> {
        let mut indexes = self.indexes.write();
        if indexes.contains_key(&spec.name) {
            return Err(StoreError::index(
                IndexErrorKind::DuplicateName,
                spec.name.clone(),
                "an index with this name already exists",
            ));
        }
        indexes.insert(spec.name.clone(), Arc::new(Index::new(spec)));
        Ok(())
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        let mut indexes = self.indexes.write();
        if indexes.shift_remove(name).is_none() {
            return Err(StoreError::index(IndexErrorKind::MissingName, name, "no such index"));
        }
        Ok(())
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.read().contains_key(name)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indexes.read().keys().cloned().collect()
    }

    fn snapshot(&self) -> Vec<Arc<Index>> {
        self.indexes.read().values().cloned().collect()
    }

    fn get(&self, name: &str) -> Option<Arc<Index>> {
        self.indexes.read().get(name).cloned()
    }

    /// Generates keys for every index and applies them. If a unique index
    /// would be violated, no index is mutated for this record.
    pub fn add_record(&self, key: &RecordKey, record: &Record) -> Result<()> {
        let indexes = self.snapshot();
        let mut per_index_keys = Vec::with_capacity(indexes.len());
        for idx in &indexes {
            let keys = idx.generate_keys(record);
            if let Some(clash) = idx.would_violate_unique(&keys, key) {
                return Err(StoreError::index(
                    IndexErrorKind::UniqueViolation,
                    idx.name().to_string(),
                    format!("value '{}' already indexed by a different record", clash),
                ));
            }
            per_index_keys.push((idx.clone(), keys));
        }
        for (idx, keys) in per_index_keys {
            idx.apply_keys(key, &keys);
        }
        Ok(())
    }

    pub fn remove_record(&self, key: &RecordKey, record: &Record) {
        for idx in self.snapshot() {
            let keys = idx.generate_keys(record);
            idx.retract_keys(key, &keys);
        }
    }

    /// Atomic pair of remove/add: if applying `new_record` would fail,
    /// `old_record`'s entries are restored.
    pub fn update_record(&self, key: &RecordKey, old_record: &Record, new_record: &Record) -> Result<()> {
        self.remove_record(key, old_record);
        if let Err(err) = self.add_record(key, new_record) {
            self.add_record(key, old_record).expect("re-adding a previously valid record cannot fail");
            return Err(err);
        }
        Ok(())
    }

    pub fn find_by_index(&self, name: &str, index_key: &str) -> Result<IndexSet<RecordKey>> {
        let idx = self
            .get(name)
            .ok_or_else(|| StoreError::index(IndexErrorKind::MissingName, name, "no such index"))?;
        Ok(idx.find(index_key))
    }

    /// Intersects per-index lookups, short-circuiting as soon as an
    /// intermediate result is empty.
    pub fn find_by_criteria(&self, criteria: &[(String, String)]) -> Result<IndexSet<RecordKey>> {
        let mut result: Option<IndexSet<RecordKey>> = None;
        for (index_name, value) in criteria {
            let hits = self.find_by_index(index_name, value)?;
            result = Some(match result {
                None => hits,
                Some(acc) => acc.intersection(&hits).cloned().collect(),
            });
            if result.as_ref().map(|r| r.is_empty()).unwrap_or(false) {
                return Ok(IndexSet::new());
            }
        }
        Ok(result.unwrap_or_default())
    }

    /// Chooses the best existing index for `fields`: an exact match on the
    /// sorted field set, else a covering superset, else the
    /// maximum-coverage candidate (ties broken by fewest total fields),
    /// else `None`.
    pub fn get_optimal_index(&self, fields: &[String]) -> Option<String> {
        let mut wanted: Vec<&str> = fields.iter().map(|s| s.as_str()).collect();
        wanted.sort();

        let indexes = self.snapshot();

        for idx in &indexes {
            if idx.fields() == wanted.as_slice() {
                return Some(idx.name().to_string());
            }
        }

        let mut supersets: Vec<&Arc<Index>> = indexes
            .iter()
            .filter(|idx| wanted.iter().all(|f| idx.fields().iter().any(|g| g == f)))
            .collect();
        if !supersets.is_empty() {
            supersets.sort_by_key(|idx| idx.fields().len());
            return Some(supersets[0].name().to_string());
        }

        let mut best: Option<(&Arc<Index>, usize)> = None;
        for idx in &indexes {
            let coverage = wanted.iter().filter(|f| idx.fields().iter().any(|g| g == *f)).count();
            if coverage == 0 {
                continue;
            }
            best = match best {
                None => Some((idx, coverage)),
                Some((cur, cur_cov)) => {
                    if coverage > cur_cov || (coverage == cur_cov && idx.fields().len() < cur.fields().len()) {
                        Some((idx, coverage))
                    } else {
                        Some((cur, cur_cov))
                    }
                }
            };
        }
        best.map(|(idx, _)| idx.name().to_string())
    }

    /// Clears and repopulates every index from `records`.
    pub fn rebuild<'a, I>(&self, records: I)
    where
        I: IntoIterator<Item = (&'a RecordKey, &'a Record)>,
    {
        let indexes = self.snapshot();
        debug!(index_count = indexes.len(), "index rebuild starting");
        for idx in &indexes {
            idx.clear();
        }
        let mut record_count = 0usize;
        for (key, record) in records {
            record_count += 1;
            for idx in &indexes {
                let keys = idx.generate_keys(record);
                idx.apply_keys(key, &keys);
            }
        }
        debug!(index_count = indexes.len(), record_count, "index rebuild finished");
    }

    pub fn stats(&self) -> IndexMap<String, IndexStats> {
        self.indexes.read().iter().map(|(name, idx)| (name.clone(), idx.stats())).collect()
    }

    pub fn index_fields(&self, name: &str) -> Option<Vec<String>> {
        self.get(name).map(|idx| idx.fields().to_vec())
    }

    pub fn index_cardinality(&self, name: &str) -> Option<usize> {
        self.get(name).map(|idx| idx.cardinality())
    }

    pub fn index_delimiter(&self, name: &str) -> Option<String> {
        self.get(name).map(|idx| idx.delimiter().to_string())
    }

    pub fn index_kind(&self, name: &str) -> Option<IndexType> {
        self.get(name).map(|idx| idx.kind())
    }

    /// Restores bucket contents from a prior [`Self::dump`], replacing the
    /// addressed indexes wholesale. Dump entries for index names that no
    /// longer exist are dropped.
    pub fn load(&self, dump: IndexMap<String, IndexMap<String, Vec<RecordKey>>>) {
        for (name, buckets) in dump {
            if let Some(idx) = self.get(&name) {
                idx.clear();
                let mut table = idx.buckets.write();
                for (index_key, members) in buckets {
                    table.insert(index_key, members.into_iter().collect());
                }
            }
        }
    }

    /// Dumps `indexName -> indexKey -> [recordKey]` for `dump("indexes")`.
    pub fn dump(&self) -> IndexMap<String, IndexMap<String, Vec<RecordKey>>> {
        self.indexes
            .read()
            .iter()
            .map(|(name, idx)| {
                let buckets = idx
                    .buckets
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
                    .collect();
                (name.clone(), buckets)
            })
            .collect()
    }
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new()
    }
}
