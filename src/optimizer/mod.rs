//! The cost-based query optimizer: plans, caches, and learns from the
//! cost of query strategies. The cost model, plan cache, and
//! learned-adjustment loop follow a `*Config` struct plus an observation
//! ring buffer with a `recalibrate`-style periodic pass, in the spirit of
//! an offline index-recommendation advisor adapted to per-query planning.
//!
//! A [`Query`] intentionally carries no closures: `filter`/`where`
//! predicates and custom sort comparators are owned and applied by the
//! caller (`Database`), while this module only needs to know *that*
//! they're present in order to choose and cost strategies. This keeps
//! plan-cache keys (built from a canonical JSON serialization of
//! `Query`) fully deterministic.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::index::IndexManager;
use crate::value::Value;

const BASE_INDEX_LOOKUP: f64 = 1.0;
const BASE_MEMORY_ACCESS: f64 = 1.0;
const BASE_COMPARISON: f64 = 2.0;
const BASE_FILTER_EVALUATION: f64 = 10.0;
const BASE_REGEX_MATCH: f64 = 20.0;
const BASE_SORT_OPERATION: f64 = 50.0;
const BASE_FULL_SCAN: f64 = 100.0;

/// The subset of a query relevant to planning: enough to choose and cost
/// strategies, with predicates/comparators represented as presence flags
/// rather than closures so the whole thing is serializable for cache keys.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Query {
    pub find: Option<BTreeMap<String, Value>>,
    pub where_criteria: Option<Vec<(String, String)>>,
    pub has_filter: bool,
    pub sort_field: Option<String>,
    pub has_custom_comparator: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Query {
    fn cache_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn find_fields(&self) -> Vec<String> {
        self.find.as_ref().map(|m| m.keys().cloned().collect()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    FullScan,
    IndexLookup,
    FilteredScan,
    Sort,
    Limit,
}

impl StepKind {
    fn label(&self) -> &'static str {
        match self {
            StepKind::FullScan => "full_scan",
            StepKind::IndexLookup => "index_lookup",
            StepKind::FilteredScan => "filtered_scan",
            StepKind::Sort => "sort",
            StepKind::Limit => "limit",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanStep {
    pub kind: StepKind,
    pub index_name: Option<String>,
    pub lookup_key: Option<String>,
    pub estimated_cost: f64,
    pub estimated_rows: usize,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub id: Uuid,
    pub steps: Vec<PlanStep>,
    pub estimated_cost: f64,
    pub estimated_rows: usize,
    pub from_cache: bool,
}

impl Plan {
    /// The step that actually fetches rows (always first).
    pub fn access_step(&self) -> Option<&PlanStep> {
        self.steps.first()
    }
}

/// Observed statistics about the data the optimizer costs plans against.
#[derive(Debug, Clone, Default)]
pub struct DataStatistics {
    pub record_count: usize,
    pub field_cardinalities: HashMap<String, usize>,
    pub null_counts: HashMap<String, usize>,
    pub index_cardinalities: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
struct CostFactors {
    base: HashMap<&'static str, f64>,
    adjustments: HashMap<&'static str, f64>,
}

impl Default for CostFactors {
    fn default() -> Self {
        let mut base = HashMap::new();
        base.insert("INDEX_LOOKUP", BASE_INDEX_LOOKUP);
        base.insert("MEMORY_ACCESS", BASE_MEMORY_ACCESS);
        base.insert("COMPARISON", BASE_COMPARISON);
        base.insert("FILTER_EVALUATION", BASE_FILTER_EVALUATION);
        base.insert("REGEX_MATCH", BASE_REGEX_MATCH);
        base.insert("SORT_OPERATION", BASE_SORT_OPERATION);
        base.insert("FULL_SCAN", BASE_FULL_SCAN);
        let adjustments = base.keys().map(|k| (*k, 1.0)).collect();
        Self { base, adjustments }
    }
}

impl CostFactors {
    fn cost(&self, factor: &str) -> f64 {
        self.base.get(factor).copied().unwrap_or(0.0) * self.adjustments.get(factor).copied().unwrap_or(1.0)
    }
}

#[derive(Debug, Clone)]
struct ExecutionRecord {
    operation: &'static str,
    estimated_cost: f64,
    actual_cost: f64,
    recorded_at: SystemTime,
}

#[derive(Debug)]
pub struct QueryOptimizerConfig {
    pub cache_ttl: Duration,
    pub max_history_size: usize,
    pub statistics_update_interval: u64,
}

impl Default for QueryOptimizerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            max_history_size: 1000,
            statistics_update_interval: 1000,
        }
    }
}

/// Plans, caches, and learns from the cost of query strategies.
#[derive(Debug)]
pub struct QueryOptimizer {
    config: QueryOptimizerConfig,
    cache: RwLock<HashMap<String, (Plan, SystemTime)>>,
    cost_factors: RwLock<CostFactors>,
    history: RwLock<VecDeque<ExecutionRecord>>,
    stats: RwLock<DataStatistics>,
    cache_hits: std::sync::atomic::AtomicU64,
    queries_planned: std::sync::atomic::AtomicU64,
}

impl QueryOptimizer {
    pub fn new() -> Self {
        Self::with_config(QueryOptimizerConfig::default())
    }

    pub fn with_config(config: QueryOptimizerConfig) -> Self {
        Self {
            config,
            cache: RwLock::new(HashMap::new()),
            cost_factors: RwLock::new(CostFactors::default()),
            history: RwLock::new(VecDeque::new()),
            stats: RwLock::new(DataStatistics::default()),
            cache_hits: std::sync::atomic::AtomicU64::new(0),
            queries_planned: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Recomputes the data statistics `est_rows` consumes: record count,
    /// per-field distinct-value counts and null counts, and per-index key
    /// cardinalities.
    pub fn update_statistics<'a, I>(&self, records: I, indexes: &IndexManager)
    where
        I: IntoIterator<Item = &'a crate::record::Record>,
    {
        use std::hash::{Hash, Hasher};

        let mut record_count = 0usize;
        let mut distinct: HashMap<String, std::collections::HashSet<u64>> = HashMap::new();
        let mut null_counts: HashMap<String, usize> = HashMap::new();
        for record in records {
            record_count += 1;
            for (field, value) in record.fields() {
                if value.is_null() {
                    *null_counts.entry(field.clone()).or_default() += 1;
                } else {
                    let mut hasher = std::collections::hash_map::DefaultHasher::new();
                    value.hash(&mut hasher);
                    distinct.entry(field.clone()).or_default().insert(hasher.finish());
                }
            }
        }

        let mut stats = self.stats.write();
        stats.record_count = record_count;
        stats.field_cardinalities = distinct.into_iter().map(|(f, set)| (f, set.len())).collect();
        stats.null_counts = null_counts;
        stats.index_cardinalities = indexes
            .index_names()
            .into_iter()
            .filter_map(|name| indexes.index_cardinality(&name).map(|c| (name, c)))
            .collect();
    }

    /// Produces a plan for `query`, reusing a cached one when available.
    pub fn plan(&self, query: &Query, indexes: &IndexManager) -> Plan {
        self.queries_planned.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let key = query.cache_key();

        if let Some((cached, cached_at)) = self.cache.read().get(&key).cloned() {
            if SystemTime::now().duration_since(cached_at).unwrap_or(Duration::ZERO) < self.config.cache_ttl {
                self.cache_hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                debug!(cache_key = %key, "query plan cache hit");
                let mut fresh = cached;
                fresh.id = Uuid::new_v4();
                fresh.from_cache = true;
                return fresh;
            }
        }

        debug!(cache_key = %key, "query plan cache miss");
        let plan = self.build_plan(query, indexes);
        self.cache.write().insert(key, (plan.clone(), SystemTime::now()));
        plan
    }

    fn est_rows(&self, index_name: &str) -> usize {
        let stats = self.stats.read();
        let cardinality = stats.index_cardinalities.get(index_name).copied().unwrap_or(0);
        if cardinality == 0 {
            stats.record_count
        } else {
            (stats.record_count / cardinality).max(1)
        }
    }

    fn build_plan(&self, query: &Query, indexes: &IndexManager) -> Plan {
        let record_count = self.stats.read().record_count;
        let factors = self.cost_factors.read();

        let mut candidates: Vec<PlanStep> = vec![PlanStep {
            kind: StepKind::FullScan,
            index_name: None,
            lookup_key: None,
            estimated_cost: factors.cost("FULL_SCAN") * record_count as f64,
            estimated_rows: record_count,
        }];

        let find_fields = query.find_fields();
        if !find_fields.is_empty() {
            if let Some(index_name) = indexes.get_optimal_index(&find_fields) {
                let rows = self.est_rows(&index_name);
                let lookup_key = query.find.as_ref().map(|f| composite_lookup_key(f, &find_fields));
                candidates.push(PlanStep {
                    kind: StepKind::IndexLookup,
                    index_name: Some(index_name),
                    lookup_key,
                    estimated_cost: factors.cost("INDEX_LOOKUP") + rows as f64 * factors.cost("MEMORY_ACCESS"),
                    estimated_rows: rows,
                });
            }
        }

        if query.has_filter || query.where_criteria.is_some() {
            // One filtered-scan candidate per available index (the index
            // narrows the scan before the predicate runs), plus a bare
            // one when no index exists.
            let names = indexes.index_names();
            if names.is_empty() {
                candidates.push(PlanStep {
                    kind: StepKind::FilteredScan,
                    index_name: None,
                    lookup_key: None,
                    estimated_cost: factors.cost("FILTER_EVALUATION") * record_count as f64,
                    estimated_rows: record_count,
                });
            }
            for name in names {
                candidates.push(PlanStep {
                    kind: StepKind::FilteredScan,
                    index_name: Some(name),
                    lookup_key: None,
                    estimated_cost: factors.cost("INDEX_LOOKUP") + factors.cost("FILTER_EVALUATION") * record_count as f64,
                    estimated_rows: record_count,
                });
            }
        }

        let best = candidates
            .into_iter()
            .min_by(|a, b| a.estimated_cost.partial_cmp(&b.estimated_cost).unwrap_or(std::cmp::Ordering::Equal))
            .expect("full_scan candidate is always present");

        let mut steps = vec![best.clone()];
        let mut total_cost = best.estimated_cost;
        let mut rows = best.estimated_rows;

        if query.sort_field.is_some() || query.has_custom_comparator {
            let sort_cost = factors.cost("SORT_OPERATION") * rows as f64;
            steps.push(PlanStep {
                kind: StepKind::Sort,
                index_name: None,
                lookup_key: None,
                estimated_cost: sort_cost,
                estimated_rows: rows,
            });
            total_cost += sort_cost;
        }

        if let Some(limit) = query.limit {
            rows = rows.min(limit);
            let limit_cost = factors.cost("MEMORY_ACCESS");
            steps.push(PlanStep {
                kind: StepKind::Limit,
                index_name: None,
                lookup_key: None,
                estimated_cost: limit_cost,
                estimated_rows: rows,
            });
            total_cost += limit_cost;
        }

        Plan {
            id: Uuid::new_v4(),
            steps,
            estimated_cost: total_cost,
            estimated_rows: rows,
            from_cache: false,
        }
    }

    /// Feeds an observed execution back into the learning loop.
    pub fn record_execution(&self, plan: &Plan, actual_cost: f64) {
        let operation = plan.access_step().map(|s| s.kind.label()).unwrap_or("full_scan");
        {
            let mut history = self.history.write();
            history.push_back(ExecutionRecord {
                operation,
                estimated_cost: plan.estimated_cost,
                actual_cost,
                recorded_at: SystemTime::now(),
            });
            if history.len() > (self.config.max_history_size as f64 * 0.8) as usize {
                let keep = (self.config.max_history_size as f64 * 0.6) as usize;
                while history.len() > keep {
                    history.pop_front();
                }
            }
        }

        let planned = self.queries_planned.load(std::sync::atomic::Ordering::Relaxed);
        if planned > 0 && planned % self.config.statistics_update_interval == 0 {
            self.recalibrate();
        }
    }

    fn recalibrate(&self) {
        let history = self.history.read();
        let mut by_op: HashMap<&'static str, Vec<(f64, f64)>> = HashMap::new();
        for record in history.iter() {
            by_op.entry(record.operation).or_default().push((record.estimated_cost, record.actual_cost));
        }
        drop(history);

        let mut factors = self.cost_factors.write();
        for (op, samples) in by_op {
            if samples.len() < 3 {
                continue;
            }
            let factor_key = factor_key_for_operation(op);
            let avg_actual: f64 = samples.iter().map(|(_, a)| a).sum::<f64>() / samples.len() as f64;
            let avg_estimated: f64 = samples.iter().map(|(e, _)| e).sum::<f64>() / samples.len() as f64;
            if avg_actual <= 0.0 || avg_estimated <= 0.0 {
                continue;
            }
            let variance = samples.iter().map(|(_, a)| (a - avg_actual).powi(2)).sum::<f64>() / samples.len() as f64;
            let coefficient_of_variation = variance.sqrt() / avg_actual;
            let consistency = 1.0 - coefficient_of_variation;

            if consistency > 0.7 {
                if let Some(adjustment) = factors.adjustments.get_mut(factor_key) {
                    let ratio = avg_actual / avg_estimated - 1.0;
                    *adjustment = (*adjustment * (1.0 + 0.1 * ratio)).clamp(0.1, 10.0);
                }
            }
        }
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    /// Drops cache entries past their TTL.
    pub fn evict_expired(&self) {
        let ttl = self.config.cache_ttl;
        let now = SystemTime::now();
        self.cache.write().retain(|_, (_, cached_at)| now.duration_since(*cached_at).unwrap_or(Duration::ZERO) < ttl);
    }
}

impl Default for QueryOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

fn factor_key_for_operation(op: &'static str) -> &'static str {
    match op {
        "index_lookup" => "INDEX_LOOKUP",
        "filtered_scan" => "FILTER_EVALUATION",
        "sort" => "SORT_OPERATION",
        "limit" => "MEMORY_ACCESS",
        _ => "FULL_SCAN",
    }
}

fn composite_lookup_key(find: &BTreeMap<String, Value>, fields: &[String]) -> String {
    let mut sorted_fields = fields.to_vec();
    sorted_fields.sort();
    sorted_fields
        .iter()
        .map(|f| find.get(f).map(|v| v.to_index_string()).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("|")
}
