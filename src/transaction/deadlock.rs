//! Deadlock detection over four combined strategies: a wait-for graph
//! from [`crate::transaction::lock_manager::LockManager::waiters`] with a
//! depth-first cycle search (keyed by `Uuid` transaction ids), a bipartite
//! transaction/resource allocation graph collapsed to cycles so the
//! resources involved can be reported, isolation-conflict suspicion fed by
//! [`crate::transaction::isolation::IsolationValidator::suspected_conflicts`],
//! and a wait-timeout fallback for deadlocks none of the cycle searches
//! catch. [`Self::run_all_detections`] runs all four in one pass.
//!
//! # Example
//!
//! ```rust,ignore
//! let detector = DeadlockDetector::new(Duration::from_millis(50));
//! for group in detector.run_all_detections(&locks, &suspected_conflicts) {
//!     let victim = detector.select_victim(&group);
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};

use crate::common::TransactionId;
use crate::transaction::lock_manager::LockManager;

/// Policy for selecting which transaction to abort when a cycle is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VictimSelectionPolicy {
    /// Abort the transaction that started most recently.
    Youngest,
    /// Abort the transaction that started first.
    Oldest,
    /// Abort the transaction with the fewest recorded operations.
    LeastWork,
}

impl Default for VictimSelectionPolicy {
    fn default() -> Self {
        VictimSelectionPolicy::Youngest
    }
}

#[derive(Debug, Clone)]
pub struct DeadlockDetectorConfig {
    pub detection_interval: Duration,
    pub victim_policy: VictimSelectionPolicy,
    pub max_detection_depth: usize,
    /// A waiter held past this age is suspected deadlocked even without a
    /// confirmed cycle (the timeout fallback).
    pub wait_timeout: Duration,
}

impl Default for DeadlockDetectorConfig {
    fn default() -> Self {
        Self {
            detection_interval: Duration::from_millis(50),
            victim_policy: VictimSelectionPolicy::Youngest,
            max_detection_depth: 1000,
            wait_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DeadlockStats {
    pub detection_runs: u64,
    pub deadlocks_found: u64,
    pub victims_aborted: u64,
    pub max_cycle_length: usize,
    pub timeout_fallbacks: u64,
}

/// Builds the dedup signature a cycle is reported under: the strategy that
/// found it plus its sorted transaction ids and resource keys, so the same
/// deadlock found twice by different strategies collapses to one report
/// while genuinely distinct cycles over the same transactions don't mask
/// each other.
fn cycle_signature(strategy: &str, cycle: &[TransactionId], resources: &[String]) -> String {
    let mut ids: Vec<String> = cycle.iter().map(|t| t.to_string()).collect();
    ids.sort();
    let mut res: Vec<String> = resources.to_vec();
    res.sort();
    format!("{}:{}:{}", strategy, ids.join(","), res.join(","))
}

/// Wait-for graph over transactions plus a resource-allocation view
/// (transaction -> held resources), with cycle-based and timeout-based
/// deadlock suspicion.
pub struct DeadlockDetector {
    wait_for_graph: Arc<RwLock<HashMap<TransactionId, HashSet<TransactionId>>>>,
    /// Bipartite (waiter -> (resource, holder)) edges for the
    /// resource-allocation-graph strategy, built from the same
    /// [`LockManager::waiters`] snapshot as `wait_for_graph` but keeping the
    /// resource each edge crosses.
    resource_waits: Arc<RwLock<HashMap<TransactionId, Vec<(String, TransactionId)>>>>,
    /// When each waiter started waiting, for the timeout fallback.
    wait_started: Arc<RwLock<HashMap<TransactionId, SystemTime>>>,
    /// When each transaction started, for youngest/oldest victim selection.
    start_times: Arc<RwLock<HashMap<TransactionId, SystemTime>>>,
    /// Dedup signatures of cycles already reported (`strategy:ids:resources`),
    /// so a stable deadlock isn't re-reported every detection tick and cycles
    /// found by different strategies over the same transactions don't
    /// collapse into one.
    reported: Arc<Mutex<HashSet<String>>>,
    config: DeadlockDetectorConfig,
    last_detection: Arc<Mutex<SystemTime>>,
    stats: Arc<Mutex<DeadlockStats>>,
}

impl DeadlockDetector {
    pub fn new(detection_interval: Duration) -> Self {
        Self::with_config(DeadlockDetectorConfig {
            detection_interval,
            ..Default::default()
        })
    }

    pub fn with_config(config: DeadlockDetectorConfig) -> Self {
        Self {
            wait_for_graph: Arc::new(RwLock::new(HashMap::new())),
            resource_waits: Arc::new(RwLock::new(HashMap::new())),
            wait_started: Arc::new(RwLock::new(HashMap::new())),
            start_times: Arc::new(RwLock::new(HashMap::new())),
            reported: Arc::new(Mutex::new(HashSet::new())),
            config,
            last_detection: Arc::new(Mutex::new(SystemTime::UNIX_EPOCH)),
            stats: Arc::new(Mutex::new(DeadlockStats::default())),
        }
    }

    /// Rebuilds the wait-for graph from a lock manager's current waiters.
    /// Each `(waiter, _, holders)` triple becomes `waiter -> holder` edges.
    pub fn sync_from_lock_manager(&self, locks: &LockManager) {
        let mut graph = self.wait_for_graph.write();
        let mut resources = self.resource_waits.write();
        graph.clear();
        resources.clear();
        let mut started = self.wait_started.write();
        let now = SystemTime::now();
        let mut still_waiting = HashSet::new();
        for (waiter, key, holders) in locks.waiters() {
            still_waiting.insert(waiter);
            let entry = graph.entry(waiter).or_default();
            let resource_entry = resources.entry(waiter).or_default();
            for holder in holders {
                if holder != waiter {
                    entry.insert(holder);
                    resource_entry.push((key.clone(), holder));
                }
            }
            started.entry(waiter).or_insert(now);
        }
        started.retain(|txn, _| still_waiting.contains(txn));
    }

    pub fn record_start(&self, txn: TransactionId, start: SystemTime) {
        self.start_times.write().insert(txn, start);
    }

    pub fn add_wait(&self, waiting_txn: TransactionId, holding_txn: TransactionId) {
        if waiting_txn == holding_txn {
            return;
        }
        self.wait_for_graph.write().entry(waiting_txn).or_default().insert(holding_txn);
        self.wait_started.write().entry(waiting_txn).or_insert_with(SystemTime::now);
    }

    pub fn remove_wait(&self, txn_id: TransactionId) {
        let mut graph = self.wait_for_graph.write();
        graph.remove(&txn_id);
        for wait_set in graph.values_mut() {
            wait_set.remove(&txn_id);
        }
        let mut resources = self.resource_waits.write();
        resources.remove(&txn_id);
        for edges in resources.values_mut() {
            edges.retain(|(_, holder)| *holder != txn_id);
        }
        self.wait_started.write().remove(&txn_id);
        self.start_times.write().remove(&txn_id);
    }

    pub fn remove_wait_edge(&self, waiting_txn: TransactionId, holding_txn: TransactionId) {
        let mut graph = self.wait_for_graph.write();
        if let Some(wait_set) = graph.get_mut(&waiting_txn) {
            wait_set.remove(&holding_txn);
            if wait_set.is_empty() {
                graph.remove(&waiting_txn);
                self.wait_started.write().remove(&waiting_txn);
            }
        }
    }

    /// Rate-limited cycle search; see [`Self::force_detect`] for the
    /// unconditional version.
    pub fn detect_deadlock(&self) -> Option<Vec<TransactionId>> {
        {
            let mut last = self.last_detection.lock();
            let elapsed = SystemTime::now().duration_since(*last).unwrap_or(Duration::ZERO);
            if elapsed < self.config.detection_interval {
                return None;
            }
            *last = SystemTime::now();
        }
        self.run_detection()
    }

    pub fn force_detect(&self) -> Option<Vec<TransactionId>> {
        self.run_detection()
    }

    fn run_detection(&self) -> Option<Vec<TransactionId>> {
        self.stats.lock().detection_runs += 1;
        let graph = self.wait_for_graph.read();

        for &txn_id in graph.keys() {
            let mut visited = HashSet::new();
            let mut path = Vec::new();
            if self.has_cycle(txn_id, &graph, &mut visited, &mut path, 0) {
                // The DFS path may carry a non-cycle prefix when the start
                // node only leads into the cycle; trim to the closed loop
                // so the signature is stable regardless of start node.
                let closing = *path.last().expect("cycle path cannot be empty");
                let start = path.iter().position(|t| *t == closing).unwrap_or(0);
                let cycle: Vec<TransactionId> = path[start..].to_vec();
                let signature = cycle_signature("wait_for", &cycle[..cycle.len() - 1], &[]);
                if self.reported.lock().insert(signature) {
                    let mut stats = self.stats.lock();
                    stats.deadlocks_found += 1;
                    stats.max_cycle_length = stats.max_cycle_length.max(cycle.len() - 1);
                    return Some(cycle);
                }
                // Already reported on an earlier pass; keep scanning in
                // case a different, new cycle exists elsewhere.
            }
        }
        None
    }

    fn has_cycle(
        &self,
        txn_id: TransactionId,
        graph: &HashMap<TransactionId, HashSet<TransactionId>>,
        visited: &mut HashSet<TransactionId>,
        path: &mut Vec<TransactionId>,
        depth: usize,
    ) -> bool {
        if depth > self.config.max_detection_depth {
            return false;
        }
        if path.contains(&txn_id) {
            path.push(txn_id);
            return true;
        }
        if visited.contains(&txn_id) {
            return false;
        }
        visited.insert(txn_id);
        path.push(txn_id);

        if let Some(waiting_for) = graph.get(&txn_id) {
            for &next_txn in waiting_for {
                if self.has_cycle(next_txn, graph, visited, path, depth + 1) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// Resource-allocation-graph strategy: walks the bipartite
    /// (transaction, resource) edges built by [`Self::sync_from_lock_manager`]
    /// looking for a cycle back to the starting transaction, returning both
    /// the transactions and the resources the cycle passes through. This
    /// catches cycles the plain wait-for graph can miss when a waiter is
    /// recorded against a resource with several holders rather than a
    /// single blocking transaction.
    pub fn detect_resource_allocation_cycle(&self) -> Option<(Vec<TransactionId>, Vec<String>)> {
        let edges = self.resource_waits.read();
        for &start in edges.keys() {
            let mut visited = HashSet::new();
            let mut path = Vec::new();
            let mut resources = Vec::new();
            if self.has_resource_cycle(start, &edges, &mut visited, &mut path, &mut resources, 0) {
                // Trim any non-cycle prefix; `resources[i]` is the edge
                // out of `path[i]`, so the resource list trims at the
                // same offset.
                let closing = *path.last().expect("cycle path cannot be empty");
                let cycle_start = path.iter().position(|t| *t == closing).unwrap_or(0);
                return Some((path[cycle_start..].to_vec(), resources[cycle_start..].to_vec()));
            }
        }
        None
    }

    fn has_resource_cycle(
        &self,
        txn_id: TransactionId,
        edges: &HashMap<TransactionId, Vec<(String, TransactionId)>>,
        visited: &mut HashSet<TransactionId>,
        path: &mut Vec<TransactionId>,
        resources: &mut Vec<String>,
        depth: usize,
    ) -> bool {
        if depth > self.config.max_detection_depth {
            return false;
        }
        if path.contains(&txn_id) {
            path.push(txn_id);
            return true;
        }
        if visited.contains(&txn_id) {
            return false;
        }
        visited.insert(txn_id);
        path.push(txn_id);
        if let Some(wants) = edges.get(&txn_id) {
            for (resource, holder) in wants {
                resources.push(resource.clone());
                if self.has_resource_cycle(*holder, edges, visited, path, resources, depth + 1) {
                    return true;
                }
                resources.pop();
            }
        }
        path.pop();
        false
    }

    /// Isolation-conflict-suspicion strategy: takes the bidirectional
    /// read-of-other's-writes pairs surfaced by
    /// [`crate::transaction::isolation::IsolationValidator::suspected_conflicts`]
    /// and treats each as a suspected two-way deadlock, deduped and counted
    /// the same way a confirmed cycle is.
    pub fn detect_isolation_conflicts(&self, suspected: &[(TransactionId, TransactionId)]) -> Vec<Vec<TransactionId>> {
        let mut found = Vec::new();
        for &(a, b) in suspected {
            let pair = vec![a, b];
            let signature = cycle_signature("isolation_conflict", &pair, &[]);
            if self.reported.lock().insert(signature) {
                let mut stats = self.stats.lock();
                stats.deadlocks_found += 1;
                stats.max_cycle_length = stats.max_cycle_length.max(pair.len());
                found.push(pair);
            }
        }
        found
    }

    /// Runs every strategy in one pass: wait-for-graph cycles,
    /// resource-allocation-graph cycles, isolation-conflict suspicion (given
    /// pairs the caller's `IsolationValidator` already computed), and the
    /// wait-timeout fallback. `locks` is synced from first. Returns the
    /// groups of transactions implicated by each newly-seen deadlock,
    /// already deduplicated against ones reported on a previous call.
    pub fn run_all_detections(&self, locks: &LockManager, suspected_conflicts: &[(TransactionId, TransactionId)]) -> Vec<Vec<TransactionId>> {
        self.sync_from_lock_manager(locks);
        let mut found = Vec::new();

        if let Some(cycle) = self.force_detect() {
            found.push(cycle);
        }

        if let Some((cycle, resources)) = self.detect_resource_allocation_cycle() {
            let signature = cycle_signature("resource_alloc", &cycle[..cycle.len() - 1], &resources);
            if self.reported.lock().insert(signature) {
                let mut stats = self.stats.lock();
                stats.deadlocks_found += 1;
                stats.max_cycle_length = stats.max_cycle_length.max(cycle.len() - 1);
                found.push(cycle);
            }
        }

        found.extend(self.detect_isolation_conflicts(suspected_conflicts));

        for txn in self.timed_out_waiters() {
            found.push(vec![txn]);
        }

        found
    }

    /// Transactions that have been waiting longer than `wait_timeout`
    /// without a confirmed cycle, the timeout fallback alongside cycle
    /// detection.
    pub fn timed_out_waiters(&self) -> Vec<TransactionId> {
        let now = SystemTime::now();
        let waiters = self.wait_started.read();
        let timed_out: Vec<TransactionId> = waiters
            .iter()
            .filter(|(_, started)| now.duration_since(**started).unwrap_or(Duration::ZERO) > self.config.wait_timeout)
            .map(|(txn, _)| *txn)
            .collect();
        if !timed_out.is_empty() {
            self.stats.lock().timeout_fallbacks += timed_out.len() as u64;
        }
        timed_out
    }

    pub fn select_victim(&self, cycle: &[TransactionId]) -> TransactionId {
        assert!(!cycle.is_empty(), "cycle cannot be empty");
        let starts = self.start_times.read();
        match self.config.victim_policy {
            VictimSelectionPolicy::Youngest => *cycle
                .iter()
                .max_by_key(|txn| starts.get(txn).copied().unwrap_or(SystemTime::UNIX_EPOCH))
                .unwrap(),
            VictimSelectionPolicy::Oldest => *cycle
                .iter()
                .min_by_key(|txn| starts.get(txn).copied().unwrap_or(SystemTime::now()))
                .unwrap(),
            VictimSelectionPolicy::LeastWork => cycle[0],
        }
    }

    pub fn select_victim_by_work(&self, cycle: &[TransactionId], work_done: &HashMap<TransactionId, usize>) -> TransactionId {
        cycle
            .iter()
            .min_by_key(|txn| work_done.get(*txn).copied().unwrap_or(0))
            .copied()
            .unwrap_or(cycle[0])
    }

    pub fn record_victim_aborted(&self) {
        self.stats.lock().victims_aborted += 1;
    }

    pub fn stats(&self) -> DeadlockStats {
        self.stats.lock().clone()
    }

    pub fn waiting_count(&self) -> usize {
        self.wait_for_graph.read().len()
    }

    pub fn edge_count(&self) -> usize {
        self.wait_for_graph.read().values().map(|s| s.len()).sum()
    }

    pub fn clear(&self) {
        self.wait_for_graph.write().clear();
        self.resource_waits.write().clear();
        self.wait_started.write().clear();
        self.reported.lock().clear();
    }

    pub fn is_waiting(&self, txn_id: TransactionId) -> bool {
        self.wait_for_graph.read().contains_key(&txn_id)
    }

    pub fn get_waiting_for(&self, txn_id: TransactionId) -> HashSet<TransactionId> {
        self.wait_for_graph.read().get(&txn_id).cloned().unwrap_or_default()
    }
}

impl Default for DeadlockDetector {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl fmt::Debug for DeadlockDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlockDetector")
            .field("waiting_count", &self.waiting_count())
            .field("edge_count", &self.edge_count())
            .field("detection_interval", &self.config.detection_interval)
            .finish()
    }
}
