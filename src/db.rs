//! The `Database` façade: the single entry point wiring the record
//! store, index manager, version manager, transaction manager, and
//! query optimizer together behind one struct, with a `StoreConfig`
//! controlling what's wired in. Every field this struct owns is
//! exercised by `set`/`get`/`delete`/`find`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::common::{generate_record_key, RecordKey};
use crate::error::{Result, StoreError};
use crate::index::{IndexManager, IndexSpec};
use crate::optimizer::{Query, QueryOptimizer};
use crate::record::{Frozen, Record, RecordHandle};
use crate::transaction::deadlock::DeadlockDetector;
use crate::transaction::isolation::IsolationValidator;
use crate::transaction::lock_manager::LockManager;
use crate::transaction::manager::{BeginOptions, TransactionManager};
use crate::transaction::types::OperationType;
use crate::store::RecordStore;
use crate::value::Value;
use crate::version::{OperationTag, RetentionPolicy, VersionManager};

pub type TransactionId = crate::common::TransactionId;

/// Per-record validation hook run before a write is applied. The
/// constraint logic itself (type detection, format checks) lives with the
/// caller; the store only enforces the verdict.
pub type SchemaCheckFn = dyn Fn(&Record) -> Result<()> + Send + Sync;

/// Store construction options.
pub struct StoreConfig {
    pub delimiter: String,
    pub id: Uuid,
    pub immutable: bool,
    pub key: String,
    pub index: Vec<IndexSpec>,
    pub versioning: bool,
    pub retention_policy: RetentionPolicy,
    pub enable_transactions: bool,
    pub enable_optimization: bool,
    pub schema: Option<Arc<SchemaCheckFn>>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            delimiter: "|".to_string(),
            id: Uuid::new_v4(),
            immutable: false,
            key: "id".to_string(),
            index: Vec::new(),
            versioning: false,
            retention_policy: RetentionPolicy::None,
            enable_transactions: false,
            enable_optimization: true,
            schema: None,
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("delimiter", &self.delimiter)
            .field("id", &self.id)
            .field("immutable", &self.immutable)
            .field("key", &self.key)
            .field("index", &self.index)
            .field("versioning", &self.versioning)
            .field("retention_policy", &self.retention_policy)
            .field("enable_transactions", &self.enable_transactions)
            .field("enable_optimization", &self.enable_optimization)
            .field("schema", &self.schema.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl StoreConfig {
    /// Checks the options that would otherwise surface as a confusing
    /// failure much later: an empty delimiter or key field, a duplicate
    /// index name, or an index with no fields (or a blank field name) to
    /// index on.
    pub fn validate(&self) -> Result<()> {
        if self.delimiter.is_empty() {
            return Err(StoreError::configuration("delimiter", "must be non-empty"));
        }
        if self.key.is_empty() {
            return Err(StoreError::configuration("key", "must be non-empty"));
        }

        let mut seen_names = std::collections::HashSet::new();
        for spec in &self.index {
            if !seen_names.insert(spec.name.as_str()) {
                return Err(StoreError::configuration("index", format!("duplicate index name '{}'", spec.name)));
            }
            if spec.fields.is_empty() {
                return Err(StoreError::configuration("index", format!("index '{}' references no fields", spec.name)));
            }
            if spec.fields.iter().any(|f| f.is_empty()) {
                return Err(StoreError::configuration("index", format!("index '{}' references a blank field name", spec.name)));
            }
        }
        Ok(())
    }
}

/// Options accepted by [`Database::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub override_existing: bool,
    /// Marks the operation as part of a batch in the transaction log.
    pub batch: bool,
    pub transaction: Option<TransactionId>,
}

/// Options accepted by read operations.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub transaction: Option<TransactionId>,
}

/// Options accepted by [`Database::find`]/[`Database::where_`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub transaction: Option<TransactionId>,
}

/// A single operation in a [`Database::batch`] call.
pub enum BatchOp {
    Set { key: Option<RecordKey>, data: Record },
    Delete { key: RecordKey },
}

/// What kind of state [`Database::dump`]/[`Database::override_store`]
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Records,
    Indexes,
}

pub enum DumpPayload {
    Records(Vec<(RecordKey, Record)>),
    Indexes(BTreeMap<String, BTreeMap<String, Vec<RecordKey>>>),
}

/// Wires components A–I together into the single public entry point.
#[derive(Debug)]
pub struct Database {
    config: RwLock<StoreConfig>,
    store: RecordStore,
    indexes: IndexManager,
    versions: VersionManager,
    txn_manager: Option<TransactionManager>,
    optimizer: Option<QueryOptimizer>,
}

impl Database {
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let indexes = IndexManager::new();
        for spec in &config.index {
            indexes.create_index(spec.clone())?;
        }

        let versions = VersionManager::new(config.retention_policy);

        let txn_manager = if config.enable_transactions {
            let locks = Arc::new(LockManager::new());
            let isolation = Arc::new(IsolationValidator::default());
            let deadlock = Arc::new(DeadlockDetector::default());
            Some(TransactionManager::new(locks, isolation, deadlock))
        } else {
            None
        };

        let optimizer = if config.enable_optimization { Some(QueryOptimizer::new()) } else { None };

        Ok(Self {
            config: RwLock::new(config),
            store: RecordStore::new(),
            indexes,
            versions,
            txn_manager,
            optimizer,
        })
    }

    fn key_field(&self) -> String {
        self.config.read().key.clone()
    }

    fn refresh_optimizer_statistics(&self) {
        if let Some(optimizer) = &self.optimizer {
            let entries = self.store.entries();
            optimizer.update_statistics(entries.iter().map(|(_, r)| r.as_ref()), &self.indexes);
        }
    }

    /// Creates or updates a record. With no existing value for `key`, the
    /// new data is stored as-is; otherwise it is merged onto the prior
    /// value unless `options.override_existing`.
    pub fn set(&self, key: Option<RecordKey>, data: Record, options: SetOptions) -> Result<Record> {
        let key_field = self.key_field();
        let mut data = data;
        let key = key.or_else(|| data.primary_key(&key_field)).unwrap_or_else(generate_record_key);
        if data.primary_key(&key_field).is_none() {
            data.set(key_field, Value::from(key.clone()));
        }
        let prior = self.store.get(&key);

        let next = match (&prior, options.override_existing) {
            (Some(existing), false) => {
                let mut merged = (**existing).clone();
                merged.merge_from(&data);
                merged
            }
            _ => data,
        };

        // Schema verdicts are recoverable: checked before anything is
        // logged or mutated.
        let schema = self.config.read().schema.clone();
        if let Some(schema) = schema {
            schema(&next)?;
        }

        // Log into the transaction before touching shared state, so a
        // rejected operation (read-only transaction, expired timeout)
        // leaves the store untouched.
        if let (Some(txn_id), Some(manager)) = (options.transaction, &self.txn_manager) {
            let metadata = options.batch.then(|| "batch".to_string());
            manager.record_write(txn_id, OperationType::Set, &key, prior.as_deref().cloned(), Some(next.clone()), metadata)?;
        }

        if let Err(err) = self.indexes.update_record(&key, prior.as_deref().unwrap_or(&Record::new()), &next) {
            // A write failing mid-transaction aborts the whole
            // transaction, undoing its earlier optimistic writes. Batch
            // items are exempt: `batch` itself decides whether a failure
            // aborts (atomic) or the next item runs (non-atomic).
            if !options.batch {
                if let (Some(txn_id), Some(manager)) = (options.transaction, &self.txn_manager) {
                    if let Ok(rollback) = manager.abort(txn_id, "write failed mid-transaction") {
                        self.apply_rollback(rollback);
                    }
                }
            }
            return Err(err);
        }
        self.store.set(key.clone(), next.clone());

        if self.versions.is_enabled(&key) || self.config.read().versioning {
            self.versions.enable(&key, None);
            if let Some(prior) = &prior {
                self.versions.add_version(&key, (**prior).clone(), OperationTag::Update);
            }
        }

        self.refresh_optimizer_statistics();
        Ok(next)
    }

    /// Reads `key`. In the default mode this returns an owned,
    /// independently mutable copy; with `config.immutable` set it returns a
    /// [`Frozen`] view sharing the stored `Arc` directly, with no copy and
    /// no way to propagate a mutation back into the store.
    pub fn get(&self, key: &str, options: ReadOptions) -> Option<RecordHandle> {
        let stored = self.store.get(key);
        if let (Some(txn_id), Some(manager)) = (options.transaction, &self.txn_manager) {
            let _ = manager.record_read(txn_id, key, stored.as_deref().cloned());
        }
        let immutable = self.config.read().immutable;
        stored.map(|arc| if immutable { RecordHandle::Frozen(Frozen::from_arc(arc)) } else { RecordHandle::Owned((*arc).clone()) })
    }

    pub fn has(&self, key: &str) -> bool {
        self.store.has(key)
    }

    pub fn delete(&self, key: &str, options: SetOptions) -> Result<bool> {
        let prior = match self.store.get(key) {
            Some(p) => p,
            None => return Err(StoreError::not_found(key)),
        };

        if let (Some(txn_id), Some(manager)) = (options.transaction, &self.txn_manager) {
            let metadata = options.batch.then(|| "batch".to_string());
            manager.record_write(txn_id, OperationType::Delete, key, Some((*prior).clone()), None, metadata)?;
        }

        self.indexes.remove_record(&key.to_string(), &prior);
        self.store.delete(key);

        if self.versions.is_enabled(key) {
            self.versions.add_version(&key.to_string(), (*prior).clone(), OperationTag::Delete);
        }

        self.refresh_optimizer_statistics();
        Ok(true)
    }

    /// Finds records by exact-value criteria on fields. When an index
    /// exactly covers the queried field set, candidates come from a single
    /// composite lookup; otherwise this degrades to a full scan filtered
    /// by the criteria. The optimizer, when enabled, plans (and learns
    /// from) every call.
    pub fn find(&self, criteria: &[(String, Value)], options: QueryOptions) -> Result<Vec<Record>> {
        let mut fields: Vec<String> = criteria.iter().map(|(f, _)| f.clone()).collect();
        fields.sort();

        let planned = self.optimizer.as_ref().map(|optimizer| {
            let find_map: BTreeMap<String, Value> = criteria.iter().cloned().collect();
            let query = Query {
                find: Some(find_map),
                limit: options.limit,
                offset: options.offset,
                ..Default::default()
            };
            (optimizer.plan(&query, &self.indexes), std::time::Instant::now())
        });

        let candidate_keys: Vec<RecordKey> = match self.exact_index_for(&fields) {
            Some(index_name) => {
                let delimiter = self
                    .indexes
                    .index_delimiter(&index_name)
                    .unwrap_or_else(|| self.config.read().delimiter.clone());
                let mut sorted_criteria: Vec<&(String, Value)> = criteria.iter().collect();
                sorted_criteria.sort_by(|a, b| a.0.cmp(&b.0));
                let lookup_key = sorted_criteria
                    .iter()
                    .map(|(_, v)| v.to_index_string())
                    .collect::<Vec<_>>()
                    .join(&delimiter);
                self.indexes.find_by_index(&index_name, &lookup_key)?.into_iter().collect()
            }
            None => self.store.keys(),
        };

        let offset = options.offset.unwrap_or(0);
        let limit = options.limit.unwrap_or(usize::MAX);
        let mut matched = 0usize;
        let mut results = Vec::new();
        for key in candidate_keys {
            let record = match self.store.get(&key) {
                Some(r) => r,
                None => continue,
            };
            if !criteria_matches(&record, criteria) {
                continue;
            }
            matched += 1;
            if matched <= offset {
                continue;
            }
            if results.len() >= limit {
                break;
            }
            if let (Some(txn_id), Some(manager)) = (options.transaction, &self.txn_manager) {
                manager.record_read(txn_id, &key, Some((*record).clone()))?;
            }
            results.push((*record).clone());
        }

        if let (Some(optimizer), Some((plan, started))) = (&self.optimizer, planned) {
            optimizer.record_execution(&plan, started.elapsed().as_secs_f64() * 1000.0);
        }
        Ok(results)
    }

    /// An index usable for a single composite lookup: one whose field set
    /// is exactly the queried fields. A superset index cannot serve a
    /// lookup (its keys embed values the query doesn't supply), and a
    /// partial index cannot either (records its filter rejects are
    /// absent from it, but `find` must still return them).
    fn exact_index_for(&self, sorted_fields: &[String]) -> Option<String> {
        if sorted_fields.is_empty() {
            return None;
        }
        let name = self.indexes.get_optimal_index(sorted_fields)?;
        if self.indexes.index_kind(&name) == Some(crate::index::IndexType::Partial) {
            return None;
        }
        match self.indexes.index_fields(&name) {
            Some(fields) if fields == sorted_fields => Some(name),
            _ => None,
        }
    }

    /// Finds records by an arbitrary predicate (a full scan, not
    /// index-accelerated).
    pub fn where_(&self, predicate: impl Fn(&Record) -> bool, options: QueryOptions) -> Vec<Record> {
        let matches: Vec<RecordKey> = self
            .store
            .entries()
            .into_iter()
            .filter(|(_, record)| predicate(record))
            .map(|(k, _)| k)
            .collect();
        self.materialize(matches, options.limit, options.offset)
    }

    fn materialize(&self, keys: Vec<RecordKey>, limit: Option<usize>, offset: Option<usize>) -> Vec<Record> {
        let offset = offset.unwrap_or(0);
        keys.into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .filter_map(|k| self.store.get(&k).map(|r| (*r).clone()))
            .collect()
    }

    /// Applies a list of operations; in non-atomic mode, per-item
    /// failures are collected rather than aborting the whole batch. In
    /// atomic mode, a failure undoes every earlier item in the batch: via
    /// `transaction`'s rollback log when one is given, or by reverting
    /// each already-applied key to its pre-batch value otherwise.
    pub fn batch(&self, ops: Vec<BatchOp>, atomic: bool, transaction: Option<TransactionId>) -> Result<Vec<Result<Record>>> {
        if !atomic {
            return Ok(ops.into_iter().map(|op| self.apply_batch_op(op, transaction)).collect());
        }

        if let Some(txn_id) = transaction {
            let mut results = Vec::with_capacity(ops.len());
            for op in ops {
                match self.apply_batch_op(op, Some(txn_id)) {
                    Ok(record) => results.push(Ok(record)),
                    Err(e) => {
                        if let Some(manager) = &self.txn_manager {
                            let rollback = manager.abort(txn_id, "batch operation failed").unwrap_or_default();
                            self.apply_rollback(rollback);
                        }
                        return Err(e);
                    }
                }
            }
            return Ok(results);
        }

        let mut applied: Vec<(RecordKey, Option<Record>)> = Vec::with_capacity(ops.len());
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let planned_key = match &op {
                BatchOp::Set { key, .. } => key.clone(),
                BatchOp::Delete { key } => Some(key.clone()),
            };
            let before = planned_key.as_ref().and_then(|k| self.store.get(k).map(|r| (*r).clone()));
            match self.apply_batch_op(op, None) {
                Ok(record) => {
                    let actual_key = planned_key.unwrap_or_else(|| record.primary_key(&self.key_field()).unwrap_or_default());
                    applied.push((actual_key, before));
                    results.push(Ok(record));
                }
                Err(e) => {
                    for (key, prior) in applied.into_iter().rev() {
                        match prior {
                            Some(p) => {
                                let _ = self.set(Some(key), p, SetOptions { override_existing: true, transaction: None, ..Default::default() });
                            }
                            None => {
                                let _ = self.delete(&key, SetOptions::default());
                            }
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(results)
    }

    fn apply_batch_op(&self, op: BatchOp, transaction: Option<TransactionId>) -> Result<Record> {
        let options = SetOptions {
            override_existing: false,
            batch: true,
            transaction,
        };
        match op {
            BatchOp::Set { key, data } => self.set(key, data, options),
            BatchOp::Delete { key } => {
                let prior = self.store.get(&key).map(|r| (*r).clone());
                self.delete(&key, options)?;
                Ok(prior.unwrap_or_default())
            }
        }
    }

    pub fn begin_transaction(&self, opts: BeginOptions) -> Result<TransactionId> {
        let manager = self.txn_manager.as_ref().ok_or_else(|| StoreError::configuration("enableTransactions", "transactions are not enabled on this store"))?;
        Ok(manager.begin(opts))
    }

    pub fn commit_transaction(&self, id: TransactionId) -> Result<()> {
        let manager = self.txn_manager.as_ref().ok_or_else(|| StoreError::configuration("enableTransactions", "transactions are not enabled on this store"))?;

        // Clear any deadlock this transaction is party to before it takes
        // commit locks; every victim's optimistic writes are undone here.
        let victims = self.run_deadlock_detection();
        if victims.contains(&id) {
            return Err(StoreError::transaction(
                crate::error::TransactionErrorKind::Deadlock,
                id.to_string(),
                "aborted as the deadlock-detection victim",
            ));
        }

        match manager.commit(id) {
            Ok(()) => Ok(()),
            Err((err, rollback)) => {
                self.apply_rollback(rollback);
                Err(err)
            }
        }
    }

    pub fn abort_transaction(&self, id: TransactionId, reason: impl Into<String>) -> Result<()> {
        let manager = self.txn_manager.as_ref().ok_or_else(|| StoreError::configuration("enableTransactions", "transactions are not enabled on this store"))?;
        let rollback = manager.abort(id, reason)?;
        self.apply_rollback(rollback);
        Ok(())
    }

    fn apply_rollback(&self, ops: Vec<crate::transaction::types::Operation>) {
        for op in ops {
            match op.op_type {
                OperationType::Set => {
                    if let Some(new_value) = op.new_value {
                        let prior = self.store.get(&op.key);
                        let _ = self.indexes.update_record(&op.key, prior.as_deref().unwrap_or(&Record::new()), &new_value);
                        self.store.set(op.key.clone(), new_value);
                    }
                }
                OperationType::Delete => {
                    if let Some(prior) = self.store.get(&op.key) {
                        self.indexes.remove_record(&op.key, &prior);
                    }
                    self.store.delete(&op.key);
                }
                OperationType::Read => {}
            }
        }
        self.refresh_optimizer_statistics();
    }

    /// Runs deadlock detection across active transactions, aborting a
    /// victim per newly-found cycle and undoing its optimistic writes.
    /// Returns the aborted transaction ids. Invoked before every commit,
    /// and callable on demand or from a periodic driver.
    pub fn run_deadlock_detection(&self) -> Vec<TransactionId> {
        let manager = match &self.txn_manager {
            Some(m) => m,
            None => return Vec::new(),
        };
        let mut victims = Vec::new();
        for (victim, rollback) in manager.run_deadlock_detection() {
            self.apply_rollback(rollback);
            victims.push(victim);
        }
        victims
    }

    pub fn cleanup_transactions(&self, max_age: Duration) -> usize {
        self.txn_manager.as_ref().map(|m| m.cleanup(max_age)).unwrap_or(0)
    }

    pub fn dump(&self, kind: DumpKind) -> DumpPayload {
        match kind {
            DumpKind::Records => {
                DumpPayload::Records(self.store.entries().into_iter().map(|(k, v)| (k, (*v).clone())).collect())
            }
            DumpKind::Indexes => {
                let dump = self.indexes.dump();
                let converted = dump
                    .into_iter()
                    .map(|(name, buckets)| (name, buckets.into_iter().map(|(k, v)| (k, v.into_iter().collect())).collect()))
                    .collect();
                DumpPayload::Indexes(converted)
            }
        }
    }

    /// Replaces the addressed store contents wholesale.
    pub fn override_store(&self, payload: DumpPayload) -> Result<()> {
        match payload {
            DumpPayload::Records(records) => {
                self.store.clear();
                for (key, record) in records {
                    self.store.set(key, record);
                }
                self.indexes.rebuild(self.store.entries().iter().map(|(k, v)| (k, v.as_ref())));
            }
            DumpPayload::Indexes(dump) => {
                let converted = dump
                    .into_iter()
                    .map(|(name, buckets)| {
                        let buckets = buckets.into_iter().collect::<indexmap::IndexMap<_, _>>();
                        (name, buckets)
                    })
                    .collect();
                self.indexes.load(converted);
            }
        }
        self.refresh_optimizer_statistics();
        Ok(())
    }

    pub fn keys(&self) -> Vec<RecordKey> {
        self.store.keys()
    }

    pub fn entries(&self) -> Vec<(RecordKey, Record)> {
        self.store.entries().into_iter().map(|(k, v)| (k, (*v).clone())).collect()
    }

    pub fn size(&self) -> usize {
        self.store.size()
    }

    pub fn index_manager(&self) -> &IndexManager {
        &self.indexes
    }

    pub fn version_manager(&self) -> &VersionManager {
        &self.versions
    }

    pub fn key_field_name(&self) -> String {
        self.key_field()
    }
}

/// True when `record` satisfies every criterion. A sequence-valued field
/// matches when any element equals the expected value, mirroring how
/// array fields contribute one index key per element.
fn criteria_matches(record: &Record, criteria: &[(String, Value)]) -> bool {
    criteria.iter().all(|(field, expected)| match record.get(field) {
        None => false,
        Some(v) if v == expected => true,
        Some(Value::Array(items)) => items.contains(expected),
        Some(_) => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(fields: &[(&str, Value)]) -> Record {
        let mut r = Record::new();
        for (k, v) in fields {
            r.set(*k, v.clone());
        }
        r
    }

    #[test]
    fn s1_composite_index_lookup_matches_exactly_one_record() {
        let mut config = StoreConfig::default();
        config.index.push(IndexSpec::new("cat_status", vec!["category".to_string(), "status".to_string()]));
        let db = Database::new(config).unwrap();

        db.set(Some("r1".into()), rec(&[("category", Value::from("A")), ("status", Value::from("active"))]), SetOptions::default()).unwrap();
        db.set(Some("r2".into()), rec(&[("category", Value::from("A")), ("status", Value::from("inactive"))]), SetOptions::default()).unwrap();

        let found = db.find(&[("category".to_string(), Value::from("A")), ("status".to_string(), Value::from("active"))], QueryOptions::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("status"), Some(&Value::from("active")));
    }

    #[test]
    fn s3_unique_violation_leaves_store_unchanged() {
        let mut config = StoreConfig::default();
        config.index.push(IndexSpec::new("email_idx", vec!["email".to_string()]).unique(true));
        let db = Database::new(config).unwrap();

        db.set(Some("r1".into()), rec(&[("email", Value::from("a@x"))]), SetOptions::default()).unwrap();
        let err = db.set(Some("r2".into()), rec(&[("email", Value::from("a@x"))]), SetOptions::default());
        assert!(err.is_err());
        assert!(!db.has("r2"));
    }

    #[test]
    fn s5_transaction_rollback_undoes_both_sets() {
        let mut config = StoreConfig::default();
        config.enable_transactions = true;
        let db = Database::new(config).unwrap();

        let tx = db.begin_transaction(BeginOptions::default()).unwrap();
        db.set(Some("r1".into()), rec(&[("v", Value::Int(1))]), SetOptions { override_existing: false, transaction: Some(tx), ..Default::default() }).unwrap();
        db.set(Some("r1".into()), rec(&[("v", Value::Int(2))]), SetOptions { override_existing: true, transaction: Some(tx), ..Default::default() }).unwrap();
        db.abort_transaction(tx, "test rollback").unwrap();

        assert!(db.get("r1", ReadOptions::default()).is_none());
    }

    #[test]
    fn s6_second_commit_fails_on_write_write_conflict() {
        let mut config = StoreConfig::default();
        config.enable_transactions = true;
        let db = Database::new(config).unwrap();

        let t1 = db.begin_transaction(BeginOptions::default()).unwrap();
        let t2 = db.begin_transaction(BeginOptions::default()).unwrap();

        db.set(Some("r1".into()), rec(&[("v", Value::Int(1))]), SetOptions { override_existing: false, transaction: Some(t1), ..Default::default() }).unwrap();
        db.set(Some("r1".into()), rec(&[("v", Value::Int(2))]), SetOptions { override_existing: false, transaction: Some(t2), ..Default::default() }).unwrap();

        assert!(db.commit_transaction(t1).is_ok());
        assert!(db.commit_transaction(t2).is_err());
    }

    #[test]
    fn dump_records_then_override_round_trips() {
        let db = Database::new(StoreConfig::default()).unwrap();
        db.set(Some("r1".into()), rec(&[("v", Value::Int(1))]), SetOptions::default()).unwrap();

        let dump = db.dump(DumpKind::Records);
        let fresh = Database::new(StoreConfig::default()).unwrap();
        fresh.override_store(dump).unwrap();

        assert_eq!(fresh.get("r1", ReadOptions::default()), db.get("r1", ReadOptions::default()));
    }

    #[test]
    fn immutable_mode_returns_a_frozen_view_sharing_storage() {
        let mut config = StoreConfig::default();
        config.immutable = true;
        let db = Database::new(config).unwrap();
        db.set(Some("r1".into()), rec(&[("v", Value::Int(1))]), SetOptions::default()).unwrap();

        let view = db.get("r1", ReadOptions::default()).unwrap();
        assert!(view.is_frozen());
        let mut mutated = view.into_owned();
        mutated.set("v", Value::Int(99));
        assert_eq!(db.get("r1", ReadOptions::default()).unwrap().get("v"), Some(&Value::Int(1)));
    }

    #[test]
    fn duplicate_index_names_are_rejected_as_a_configuration_error() {
        let mut config = StoreConfig::default();
        config.index.push(IndexSpec::new("by_email", vec!["email".to_string()]));
        config.index.push(IndexSpec::new("by_email", vec!["email".to_string()]));
        let err = Database::new(config).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigurationError);
    }

    #[test]
    fn an_index_with_no_fields_is_rejected_as_a_configuration_error() {
        let mut config = StoreConfig::default();
        config.index.push(IndexSpec::new("empty_idx", vec![]));
        let err = Database::new(config).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigurationError);
    }

    #[test]
    fn schema_hook_rejects_invalid_records_before_any_write() {
        let mut config = StoreConfig::default();
        config.schema = Some(Arc::new(|r: &Record| {
            if r.get("email").is_some() {
                Ok(())
            } else {
                Err(StoreError::validation("email", "required field is missing"))
            }
        }));
        let db = Database::new(config).unwrap();

        let err = db.set(Some("r1".into()), rec(&[("v", Value::Int(1))]), SetOptions::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(!db.has("r1"));

        db.set(Some("r2".into()), rec(&[("email", Value::from("a@x"))]), SetOptions::default()).unwrap();
        assert!(db.has("r2"));
    }

    #[test]
    fn a_failed_write_inside_a_transaction_aborts_it() {
        let mut config = StoreConfig::default();
        config.enable_transactions = true;
        config.index.push(IndexSpec::new("email_idx", vec!["email".to_string()]).unique(true));
        let db = Database::new(config).unwrap();
        db.set(Some("taken".into()), rec(&[("email", Value::from("a@x"))]), SetOptions::default()).unwrap();

        let tx = db.begin_transaction(BeginOptions::default()).unwrap();
        db.set(Some("r1".into()), rec(&[("v", Value::Int(1))]), SetOptions { override_existing: false, transaction: Some(tx), ..Default::default() }).unwrap();
        let err = db.set(Some("r2".into()), rec(&[("email", Value::from("a@x"))]), SetOptions { override_existing: false, transaction: Some(tx), ..Default::default() });

        assert!(err.is_err());
        assert!(!db.has("r1"), "the earlier write in the aborted transaction must be undone");
        assert!(db.commit_transaction(tx).is_ok(), "commit of a terminal transaction is a no-op");
    }

    #[test]
    fn default_mode_returns_an_owned_copy() {
        let db = Database::new(StoreConfig::default()).unwrap();
        db.set(Some("r1".into()), rec(&[("v", Value::Int(1))]), SetOptions::default()).unwrap();
        let view = db.get("r1", ReadOptions::default()).unwrap();
        assert!(!view.is_frozen());
    }
}
