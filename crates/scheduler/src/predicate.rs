use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use rayon::prelude::*;
use tracing::debug;

use harvest_core::types::{NodeInfo, TaskId, TaskInfo};

use crate::session::PredicateFn;

const CACHE_BUCKETS: usize = 16;

/// Session-scoped memo of predicate failures, keyed by (task, node).
///
/// Reclaim retries many tasks against many nodes inside one cycle; the
/// snapshot is immutable for the cycle, so a failure observed once holds
/// for the rest of the session. Lock striping keeps shard workers from
/// contending on a single map.
pub struct PredicateCache {
    buckets: Vec<Mutex<HashMap<(TaskId, String), String>>>,
}

impl PredicateCache {
    pub fn new() -> Self {
        Self {
            buckets: (0..CACHE_BUCKETS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn bucket(&self, task: TaskId, node: &str) -> &Mutex<HashMap<(TaskId, String), String>> {
        let mut hasher = DefaultHasher::new();
        task.hash(&mut hasher);
        node.hash(&mut hasher);
        &self.buckets[hasher.finish() as usize % CACHE_BUCKETS]
    }

    pub fn get(&self, task: TaskId, node: &str) -> Option<String> {
        self.bucket(task, node)
            .lock()
            .expect("predicate cache lock poisoned")
            .get(&(task, node.to_string()))
            .cloned()
    }

    pub fn insert(&self, task: TaskId, node: &str, reason: String) {
        self.bucket(task, node)
            .lock()
            .expect("predicate cache lock poisoned")
            .insert((task, node.to_string()), reason);
    }
}

impl Default for PredicateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluates per-node predicates for a task in parallel across shards.
pub struct PredicateHelper {
    enable_error_cache: bool,
}

impl PredicateHelper {
    pub fn new(enable_error_cache: bool) -> Self {
        Self { enable_error_cache }
    }

    /// Filter `nodes` down to those where `predicate` passes for `task`.
    ///
    /// Nodes are partitioned into buckets per `shards` (unassigned nodes
    /// land in bucket zero); buckets evaluate in parallel, sequentially
    /// within each bucket, and results are gathered ordered by
    /// (shard index, node name) so downstream iteration is reproducible.
    pub fn predicate_nodes(
        &self,
        task: &TaskInfo,
        nodes: &[&NodeInfo],
        predicate: &PredicateFn,
        shards: &HashMap<String, usize>,
        cache: &PredicateCache,
    ) -> Vec<String> {
        if nodes.is_empty() {
            return Vec::new();
        }

        let shard_count = shards.values().max().map(|m| m + 1).unwrap_or(1);
        let mut buckets: Vec<Vec<&NodeInfo>> = vec![Vec::new(); shard_count];
        for &node in nodes {
            let shard = shards.get(&node.name).copied().unwrap_or(0);
            buckets[shard].push(node);
        }
        for bucket in &mut buckets {
            bucket.sort_by(|a, b| a.name.cmp(&b.name));
        }

        let passed: Vec<Vec<String>> = buckets
            .par_iter()
            .map(|bucket| {
                let mut names = Vec::new();
                for &node in bucket {
                    if self.enable_error_cache {
                        if let Some(reason) = cache.get(task.id, &node.name) {
                            debug!(
                                "Cached predicate failure for task {} on node {}: {}",
                                task.name, node.name, reason
                            );
                            continue;
                        }
                    }
                    match predicate(task, node) {
                        Ok(()) => names.push(node.name.clone()),
                        Err(reason) => {
                            debug!(
                                "Predicate failed for task {} on node {}: {}",
                                task.name, node.name, reason
                            );
                            if self.enable_error_cache {
                                cache.insert(task.id, &node.name, reason);
                            }
                        }
                    }
                }
                names
            })
            .collect();

        passed.into_iter().flatten().collect()
    }
}
