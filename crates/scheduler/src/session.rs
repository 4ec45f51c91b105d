use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;
use uuid::Uuid;

use harvest_core::config::ActionConfigurations;
use harvest_core::resource::Tolerance;
use harvest_core::types::{JobId, JobInfo, NodeInfo, QueueId, QueueInfo, TaskInfo};

use crate::predicate::PredicateCache;
use crate::queue::{OrderFn, PriorityQueue};

/// Comparator fragment contributed by a plugin. `None` means the fragment
/// has no opinion and the next fragment decides.
pub type OrderFragment<T> = Arc<dyn Fn(&T, &T) -> Option<Ordering> + Send + Sync>;

/// Per-node feasibility check for a task being placed by preemption-style
/// actions. The error string is the failure reason (and the cache value).
pub type PredicateFn = Arc<dyn Fn(&TaskInfo, &NodeInfo) -> Result<(), String> + Send + Sync>;
pub type PrePredicateFn = Arc<dyn Fn(&TaskInfo) -> Result<(), String> + Send + Sync>;

pub type JobPolicyFn = Arc<dyn Fn(&JobInfo) -> bool + Send + Sync>;
pub type QueuePolicyFn = Arc<dyn Fn(&QueueInfo) -> bool + Send + Sync>;
pub type PreemptiveFn = Arc<dyn Fn(&QueueInfo, &TaskInfo) -> bool + Send + Sync>;
/// Policy filter over eviction candidates; returns the survivors.
pub type ReclaimableFn = Arc<dyn Fn(&TaskInfo, Vec<TaskInfo>) -> Vec<TaskInfo> + Send + Sync>;

/// Commit-time dispatch hooks installed by the surrounding scheduler:
/// the eviction executor and the binder. Pipeline placements defer their
/// bind, so only Allocate operations reach `on_bind` at commit.
#[derive(Clone, Default)]
pub struct CommitSinks {
    pub on_evict: Option<Arc<dyn Fn(&TaskInfo, &str) + Send + Sync>>,
    pub on_bind: Option<Arc<dyn Fn(&TaskInfo, &str) + Send + Sync>>,
}

/// Snapshot of cluster state for one scheduling cycle, plus the ordering,
/// predicate, and policy hooks composed from registered plugins.
///
/// The snapshot maps are read-only from an action's perspective except
/// through `Statement` operations.
pub struct Session {
    pub uid: Uuid,
    pub jobs: HashMap<JobId, JobInfo>,
    pub queues: HashMap<QueueId, QueueInfo>,
    pub nodes: HashMap<String, NodeInfo>,
    pub configurations: ActionConfigurations,
    /// Cycle time budget; actions check it only at loop boundaries.
    pub deadline: Option<Instant>,
    /// Number of buckets nodes are partitioned into for parallel
    /// predicate evaluation.
    pub shard_count: usize,

    queue_order: Vec<OrderFragment<QueueInfo>>,
    job_order: Vec<OrderFragment<JobInfo>>,
    task_order: Vec<OrderFragment<TaskInfo>>,
    victim_order: Vec<OrderFragment<TaskInfo>>,

    predicate_for_preempt_action: PredicateFn,
    pre_predicate: PrePredicateFn,

    job_valid: JobPolicyFn,
    job_starving: JobPolicyFn,
    job_pipelined: JobPolicyFn,
    overused: QueuePolicyFn,
    preemptive: PreemptiveFn,
    reclaimable: ReclaimableFn,

    sinks: Vec<CommitSinks>,
    pub(crate) predicate_cache: PredicateCache,
}

impl Session {
    pub fn new() -> Self {
        Self {
            uid: Uuid::new_v4(),
            jobs: HashMap::new(),
            queues: HashMap::new(),
            nodes: HashMap::new(),
            configurations: ActionConfigurations::new(),
            deadline: None,
            shard_count: 8,
            // Higher queue weight goes first
            queue_order: vec![Arc::new(|a: &QueueInfo, b: &QueueInfo| {
                if a.weight == b.weight {
                    None
                } else {
                    Some(b.weight.cmp(&a.weight))
                }
            })],
            job_order: Vec::new(),
            // Higher task priority goes first
            task_order: vec![Arc::new(|a: &TaskInfo, b: &TaskInfo| {
                if a.priority == b.priority {
                    None
                } else {
                    Some(b.priority.cmp(&a.priority))
                }
            })],
            // Cheapest victim goes first
            victim_order: vec![Arc::new(|a: &TaskInfo, b: &TaskInfo| {
                if a.priority == b.priority {
                    None
                } else {
                    Some(a.priority.cmp(&b.priority))
                }
            })],
            predicate_for_preempt_action: Arc::new(|_, _| Ok(())),
            pre_predicate: Arc::new(|_| Ok(())),
            job_valid: Arc::new(|_| true),
            job_starving: Arc::new(|job| {
                job.pending_task_count() > 0
                    && !job.total_request.less_equal(&job.allocated, Tolerance::Epsilon)
            }),
            job_pipelined: Arc::new(|job| job.occupied_task_count() >= job.min_available as usize),
            overused: Arc::new(|_| false),
            preemptive: Arc::new(|_, _| true),
            reclaimable: Arc::new(|_, candidates| candidates),
            sinks: Vec::new(),
            predicate_cache: PredicateCache::new(),
        }
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    // --- Plugin registration ---

    /// Prepend a queue-ordering fragment; the newest registration wins
    /// when it has an opinion.
    pub fn register_queue_order(&mut self, fragment: OrderFragment<QueueInfo>) {
        self.queue_order.insert(0, fragment);
    }

    pub fn register_job_order(&mut self, fragment: OrderFragment<JobInfo>) {
        self.job_order.insert(0, fragment);
    }

    pub fn register_task_order(&mut self, fragment: OrderFragment<TaskInfo>) {
        self.task_order.insert(0, fragment);
    }

    pub fn register_victim_order(&mut self, fragment: OrderFragment<TaskInfo>) {
        self.victim_order.insert(0, fragment);
    }

    pub fn set_predicate_for_preempt_action(&mut self, f: PredicateFn) {
        self.predicate_for_preempt_action = f;
    }

    pub fn set_pre_predicate_fn(&mut self, f: PrePredicateFn) {
        self.pre_predicate = f;
    }

    pub fn set_job_valid_fn(&mut self, f: JobPolicyFn) {
        self.job_valid = f;
    }

    pub fn set_job_starving_fn(&mut self, f: JobPolicyFn) {
        self.job_starving = f;
    }

    pub fn set_job_pipelined_fn(&mut self, f: JobPolicyFn) {
        self.job_pipelined = f;
    }

    pub fn set_overused_fn(&mut self, f: QueuePolicyFn) {
        self.overused = f;
    }

    pub fn set_preemptive_fn(&mut self, f: PreemptiveFn) {
        self.preemptive = f;
    }

    pub fn set_reclaimable_fn(&mut self, f: ReclaimableFn) {
        self.reclaimable = f;
    }

    pub fn register_commit_sinks(&mut self, sinks: CommitSinks) {
        self.sinks.push(sinks);
    }

    pub(crate) fn sinks(&self) -> &[CommitSinks] {
        &self.sinks
    }

    // --- Composed orderings ---

    pub fn queue_order_fn(&self) -> OrderFn<QueueInfo> {
        compose(self.queue_order.clone(), |q: &QueueInfo| q.id)
    }

    pub fn job_order_fn(&self) -> OrderFn<JobInfo> {
        compose(self.job_order.clone(), |j: &JobInfo| j.id)
    }

    pub fn task_order_fn(&self) -> OrderFn<TaskInfo> {
        compose(self.task_order.clone(), |t: &TaskInfo| t.id)
    }

    pub fn victim_order_fn(&self) -> OrderFn<TaskInfo> {
        compose(self.victim_order.clone(), |t: &TaskInfo| t.id)
    }

    // --- Predicates ---

    pub fn predicate_for_preempt_action(&self) -> PredicateFn {
        Arc::clone(&self.predicate_for_preempt_action)
    }

    pub fn pre_predicate(&self, task: &TaskInfo) -> Result<(), String> {
        (self.pre_predicate)(task)
    }

    // --- Policy queries ---

    pub fn job_valid(&self, job: &JobInfo) -> bool {
        (self.job_valid)(job)
    }

    /// The job has pending work and sits below its entitlement.
    pub fn job_starving(&self, job: &JobInfo) -> bool {
        (self.job_starving)(job)
    }

    /// Enough tasks are (tentatively) placed to satisfy the job's
    /// minimum-member contract.
    pub fn job_pipelined(&self, job: &JobInfo) -> bool {
        (self.job_pipelined)(job)
    }

    pub fn overused(&self, queue: &QueueInfo) -> bool {
        (self.overused)(queue)
    }

    pub fn preemptive(&self, queue: &QueueInfo, task: &TaskInfo) -> bool {
        (self.preemptive)(queue, task)
    }

    pub fn reclaimable(&self, task: &TaskInfo, candidates: Vec<TaskInfo>) -> Vec<TaskInfo> {
        (self.reclaimable)(task, candidates)
    }

    // --- Node filters ---

    /// Candidate node names for a task, unschedulable nodes pruned.
    /// Sorted so downstream iteration is reproducible.
    pub fn filter_out_unschedulable_and_unresolvable_nodes_for_task(
        &self,
        task: &TaskInfo,
    ) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.schedulable)
            .map(|n| n.name.clone())
            .collect();
        names.sort();
        debug!(
            "Task {} has {} schedulable candidate nodes",
            task.name,
            names.len()
        );
        names
    }

    /// Round-robin assignment of sorted node names into shard buckets.
    pub fn nodes_in_shard(&self) -> HashMap<String, usize> {
        let shards = self.shard_count.max(1);
        let mut names: Vec<&String> = self.nodes.keys().collect();
        names.sort();
        names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i % shards))
            .collect()
    }

    // --- Factories ---

    /// Fresh victim queue ordered by the composed victim ordering,
    /// pre-seeded with `initial`.
    pub fn build_victim_priority_queue(
        &self,
        initial: Vec<TaskInfo>,
        requester: &TaskInfo,
    ) -> PriorityQueue<TaskInfo> {
        debug!(
            "Building victim queue of {} candidates for task {}",
            initial.len(),
            requester.name
        );
        PriorityQueue::with_items(self.victim_order_fn(), initial)
    }

}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Compose comparator fragments left-to-right with a stable tie-break on
/// an opaque identity, making the resulting ordering total.
fn compose<T: 'static, K: Ord>(
    fragments: Vec<OrderFragment<T>>,
    identity: impl Fn(&T) -> K + Send + Sync + 'static,
) -> OrderFn<T> {
    Arc::new(move |a, b| {
        for fragment in &fragments {
            match fragment(a, b) {
                Some(Ordering::Less) => return true,
                Some(Ordering::Greater) => return false,
                _ => {}
            }
        }
        identity(a) < identity(b)
    })
}
