use std::collections::{HashMap, HashSet};

use tracing::{debug, error, info};

use harvest_core::config::ReclaimConfig;
use harvest_core::error::CoreError;
use harvest_core::resource::{Resource, Tolerance};
use harvest_core::types::{
    JobId, JobInfo, NodeInfo, PreemptionPolicy, QueueId, TaskId, TaskInfo, TaskStatus,
};

use crate::predicate::PredicateHelper;
use crate::queue::PriorityQueue;
use crate::session::Session;
use crate::statement::{save_operations, OperationLog, Statement};
use crate::Action;

/// Reclaim evicts running work from queues over their entitlement to make
/// room for starving jobs in other queues. Evictions are planned per node
/// in child statements and merged into the job's statement only when the
/// whole node plan succeeds.
pub struct ReclaimAction {
    config: ReclaimConfig,
}

impl ReclaimAction {
    pub fn new() -> Self {
        Self {
            config: ReclaimConfig::default(),
        }
    }
}

impl Default for ReclaimAction {
    fn default() -> Self {
        Self::new()
    }
}

impl Action for ReclaimAction {
    fn name(&self) -> &str {
        "reclaim"
    }

    fn execute(&mut self, ssn: &mut Session) {
        debug!("Enter reclaim");
        self.config = ReclaimConfig::from_action_args(&ssn.configurations, self.name());

        let mut queues = PriorityQueue::new(ssn.queue_order_fn());
        let mut queued: HashSet<QueueId> = HashSet::new();
        let mut preemptors_map: HashMap<QueueId, PriorityQueue<JobInfo>> = HashMap::new();
        let mut preemptor_tasks: HashMap<JobId, PriorityQueue<TaskInfo>> = HashMap::new();

        info!(
            "There are {} jobs and {} queues in total for scheduling",
            ssn.jobs.len(),
            ssn.queues.len()
        );

        let mut job_ids: Vec<JobId> = ssn.jobs.keys().copied().collect();
        job_ids.sort();
        for job_id in job_ids {
            let job = &ssn.jobs[&job_id];
            if job.is_pending() {
                continue;
            }
            if !ssn.job_valid(job) {
                debug!(
                    "Job {}/{} in queue skips reclaim: not valid",
                    job.namespace, job.name
                );
                continue;
            }
            let Some(queue) = ssn.queues.get(&job.queue) else {
                error!(
                    "Failed to find queue for job {}/{}",
                    job.namespace, job.name
                );
                continue;
            };
            if queued.insert(queue.id) {
                debug!("Added queue {} for job {}/{}", queue.name, job.namespace, job.name);
                queues.push(queue.clone());
            }
            if ssn.job_starving(job) {
                preemptors_map
                    .entry(queue.id)
                    .or_insert_with(|| PriorityQueue::new(ssn.job_order_fn()))
                    .push(job.clone());
                let mut tasks = PriorityQueue::new(ssn.task_order_fn());
                for task_id in job.task_ids_with_status(TaskStatus::Pending) {
                    let task = &job.tasks[&task_id];
                    if task.sched_gated {
                        continue;
                    }
                    tasks.push(task.clone());
                }
                preemptor_tasks.insert(job.id, tasks);
            }
        }

        while let Some(queue) = queues.pop() {
            if ssn.deadline_exceeded() {
                debug!("Cycle deadline exceeded, stopping reclaim");
                break;
            }
            if ssn.overused(&queue) {
                debug!("Queue {} is overused, ignore it", queue.name);
                continue;
            }

            let more_jobs;
            let job = {
                let Some(jobs) = preemptors_map.get_mut(&queue.id) else {
                    debug!("No preemptors in queue {}", queue.name);
                    continue;
                };
                let Some(job) = jobs.pop() else {
                    debug!("No preemptors left in queue {}", queue.name);
                    continue;
                };
                more_jobs = !jobs.is_empty();
                job
            };

            let mut stmt = Statement::new();
            loop {
                if ssn.deadline_exceeded() {
                    break;
                }
                // Stop once the job no longer requests more resources
                let starving = ssn
                    .jobs
                    .get(&job.id)
                    .map(|j| ssn.job_starving(j))
                    .unwrap_or(false);
                if !starving {
                    break;
                }
                let Some(task) = preemptor_tasks.get_mut(&job.id).and_then(|q| q.pop()) else {
                    debug!("No preemptor task in job {}/{}", job.namespace, job.name);
                    break;
                };

                if task.preemption_policy == PreemptionPolicy::Never {
                    debug!(
                        "Task {}/{} cannot reclaim (preemption policy Never)",
                        job.namespace, task.name
                    );
                    continue;
                }
                if !ssn.preemptive(&queue, &task) {
                    debug!(
                        "Queue {} cannot reclaim for task {}, skip",
                        queue.name, task.name
                    );
                    continue;
                }
                if let Err(reason) = ssn.pre_predicate(&task) {
                    debug!(
                        "PrePredicate failed for task {}/{}: {}",
                        job.namespace, task.name, reason
                    );
                    continue;
                }

                self.reclaim_for_task(ssn, &mut stmt, &task, &job);
            }

            let pipelined = ssn
                .jobs
                .get(&job.id)
                .map(|j| ssn.job_pipelined(j))
                .unwrap_or(false);
            if pipelined {
                if let Err(e) = stmt.commit(ssn) {
                    error!(
                        "Failed to commit statement for job {}/{}: {}",
                        job.namespace, job.name, e
                    );
                }
            } else {
                stmt.discard(ssn);
            }

            if more_jobs {
                queues.push(queue);
            }
        }
        debug!("Leaving reclaim");
    }
}

/// Per-node reclaim state for one attempt.
struct VictimPlan {
    node: String,
    victims: PriorityQueue<TaskInfo>,
    reclaimed: Resource,
    available: Resource,
}

impl ReclaimAction {
    fn reclaim_for_task(
        &self,
        ssn: &mut Session,
        stmt: &mut Statement,
        task: &TaskInfo,
        job: &JobInfo,
    ) {
        let total_nodes = ssn.filter_out_unschedulable_and_unresolvable_nodes_for_task(task);
        let helper = PredicateHelper::new(self.config.enable_predicate_error_cache);
        let shards = ssn.nodes_in_shard();
        let predicate = ssn.predicate_for_preempt_action();
        let predicate_nodes = {
            let node_refs: Vec<&NodeInfo> = total_nodes
                .iter()
                .filter_map(|name| ssn.nodes.get(name))
                .collect();
            helper.predicate_nodes(task, &node_refs, &predicate, &shards, &ssn.predicate_cache)
        };

        let mut all_victims = ssn.build_victim_priority_queue(Vec::new(), task);
        let mut victim_to_node: HashMap<TaskId, String> = HashMap::new();
        let mut node_victims_map: HashMap<String, VictimPlan> = HashMap::new();

        for name in &predicate_nodes {
            let Some(node) = ssn.nodes.get(name) else {
                continue;
            };
            debug!(
                "Considering task {}/{} on node {}",
                job.namespace, task.name, name
            );

            let mut tasks_on_node: Vec<&TaskInfo> = node.tasks.values().collect();
            tasks_on_node.sort_by_key(|t| t.id);

            let mut reclaimees: Vec<TaskInfo> = Vec::new();
            for task_on_node in tasks_on_node {
                if task_on_node.status != TaskStatus::Running || !task_on_node.preemptable {
                    continue;
                }
                let Some(owner) = ssn.jobs.get(&task_on_node.job) else {
                    continue;
                };
                // Only cross-queue victims from reclaimable queues qualify
                if owner.queue == job.queue {
                    continue;
                }
                let Some(owner_queue) = ssn.queues.get(&owner.queue) else {
                    continue;
                };
                if !owner_queue.reclaimable {
                    continue;
                }
                reclaimees.push(task_on_node.clone());
            }

            if reclaimees.is_empty() {
                debug!("No reclaimees on node {}", name);
                continue;
            }

            let victims = ssn.reclaimable(task, reclaimees);
            if let Err(e) = validate_victims(task, node, &victims) {
                debug!("No validated victims on node {}: {}", name, e);
                continue;
            }

            let plan_queue = ssn.build_victim_priority_queue(victims.clone(), task);
            node_victims_map.insert(
                name.clone(),
                VictimPlan {
                    node: name.clone(),
                    victims: plan_queue,
                    reclaimed: Resource::zero(),
                    available: node.future_idle(),
                },
            );
            for victim in victims {
                victim_to_node.insert(victim.id, name.clone());
                all_victims.push(victim);
            }
        }

        if all_victims.is_empty() {
            debug!(
                "No victims found for task {}/{}",
                job.namespace, task.name
            );
            return;
        }

        // Parent log snapshot, restored untouched if every node fails
        let saved_original = save_operations(&[&*stmt as &dyn OperationLog]);
        let mut tried_nodes: HashSet<String> = HashSet::new();

        while let Some(initiator) = all_victims.pop() {
            let Some(node_name) = victim_to_node.get(&initiator.id).cloned() else {
                continue;
            };
            debug!(
                "Initiator victim {} triggers a reclaim attempt on node {} for task {}/{}",
                initiator.name, node_name, job.namespace, task.name
            );
            if tried_nodes.contains(&node_name) {
                debug!("Node {} already tried, skipping", node_name);
                continue;
            }
            let Some(plan) = node_victims_map.get(&node_name) else {
                continue;
            };

            let mut node_stmt = Statement::new();
            let mut node_queue = plan.victims.clone();
            let mut reclaimed = plan.reclaimed.clone();
            let mut available = plan.available.clone();
            debug!(
                "Trying node {} with {} victims for task {}/{}",
                plan.node,
                node_queue.len(),
                job.namespace,
                task.name
            );
            let mut eviction_failed = false;
            let mut eviction_occurred = false;
            let mut task_can_be_pipelined = false;

            while let Some(victim) = node_queue.pop() {
                if let Err(e) = node_stmt.evict(ssn, &victim, "reclaim") {
                    error!(
                        "Failed to evict task {} for task {}/{} on node {}: {}",
                        victim.name, job.namespace, task.name, node_name, e
                    );
                    eviction_failed = true;
                    break;
                }
                reclaimed.add(&victim.resreq);
                available.add(&victim.resreq);
                eviction_occurred = true;
                debug!(
                    "Reclaimed {} for task {}/{} on node {}: available {}, reclaimed {}",
                    victim.name, job.namespace, task.name, node_name, available, reclaimed
                );
                if task.init_resreq.less_equal(&available, Tolerance::Exact) {
                    task_can_be_pipelined = true;
                    break;
                }
            }
            tried_nodes.insert(node_name.clone());

            if eviction_failed {
                debug!(
                    "Eviction failed on node {}, discarding its evictions and trying the next node",
                    node_name
                );
                node_stmt.discard(ssn);
                continue;
            }
            if !task_can_be_pipelined {
                debug!(
                    "Not enough on node {} after reclaiming (reclaimed {}, available {}, required {}), trying the next node",
                    node_name, reclaimed, available, task.init_resreq
                );
                node_stmt.discard(ssn);
                continue;
            }

            if let Err(e) = node_stmt.pipeline(ssn, task, &node_name, eviction_occurred) {
                error!(
                    "Failed to pipeline task {}/{} on node {}: {}",
                    job.namespace, task.name, node_name, e
                );
                node_stmt.discard(ssn);
                continue;
            }

            let merged = save_operations(&[&saved_original as &dyn OperationLog, &node_stmt]);
            node_stmt.discard(ssn);

            if let Err(e) = stmt.recover_operations(ssn, &merged) {
                error!("Failed to install merged statement operations: {}", e);
                stmt.discard(ssn);
                if let Err(e) = stmt.recover_operations(ssn, &saved_original) {
                    // Cannot proceed with this task; close-out cleans up
                    error!("Failed to recover original statement operations: {}", e);
                    return;
                }
                continue;
            }
            debug!(
                "Reclaimed and pipelined task {}/{} on node {} (reclaimed {})",
                job.namespace, task.name, node_name, reclaimed
            );
            return;
        }
        debug!(
            "Failed to reclaim resources for task {}/{} on any node",
            job.namespace, task.name
        );
    }
}

/// Sanity checks over a node's candidate set: at least one victim, and
/// every victim's request must be a well-formed quantity.
fn validate_victims(
    task: &TaskInfo,
    node: &NodeInfo,
    victims: &[TaskInfo],
) -> Result<(), CoreError> {
    if victims.is_empty() {
        return Err(CoreError::NoVictims {
            name: node.name.clone(),
        });
    }
    for victim in victims {
        let r = &victim.resreq;
        if r.cpu_milli < 0.0 || r.memory_bytes < 0.0 || r.devices.values().any(|q| *q < 0.0) {
            return Err(CoreError::InvalidVictim(format!(
                "victim {} for task {} carries a negative resource request",
                victim.name, task.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_common::*;
    use std::sync::Arc;

    /// One starving job in q1 and one reclaimable victim in q2.
    fn simple_cluster() -> (Session, JobId, TaskId, JobId, TaskId) {
        let mut ssn = make_session();
        let q1 = add_queue(&mut ssn, "q1", true, 1);
        let q2 = add_queue(&mut ssn, "q2", true, 1);
        add_node(&mut ssn, "node-0", 0.0);

        let starving = add_job(&mut ssn, "job-a", q1, 1);
        let ta = add_pending_task(&mut ssn, starving, "ta", 2000.0);

        let victim_job = add_job(&mut ssn, "job-b", q2, 1);
        let tv = add_running_task(&mut ssn, victim_job, "tv", "node-0", 2000.0, 0);

        (ssn, starving, ta, victim_job, tv)
    }

    #[test]
    fn test_simple_reclaim_pipelines_the_starving_task() {
        let (mut ssn, starving, ta, victim_job, tv) = simple_cluster();

        let mut action = ReclaimAction::new();
        action.execute(&mut ssn);

        assert_eq!(ssn.jobs[&starving].tasks[&ta].status, TaskStatus::Pipelined);
        assert_eq!(
            ssn.jobs[&starving].tasks[&ta].node_name.as_deref(),
            Some("node-0")
        );
        assert_eq!(ssn.jobs[&victim_job].tasks[&tv].status, TaskStatus::Releasing);

        // Commit credited the victim's release to the node
        let future_idle = ssn.nodes["node-0"].future_idle();
        let expected = Resource::new(2000.0, 0.0);
        assert!(future_idle.less_equal(&expected, Tolerance::Exact));
        assert!(expected.less_equal(&future_idle, Tolerance::Exact));
        assert!(ssn.jobs[&victim_job].allocated.is_empty());
    }

    #[test]
    fn test_insufficient_first_node_leaves_no_trace() {
        let mut ssn = make_session();
        let q1 = add_queue(&mut ssn, "q1", true, 1);
        let q2 = add_queue(&mut ssn, "q2", true, 1);
        add_node(&mut ssn, "node-1", 0.0);
        add_node(&mut ssn, "node-2", 0.0);

        let starving = add_job(&mut ssn, "job-a", q1, 1);
        let ta = add_pending_task(&mut ssn, starving, "ta", 2000.0);

        let victim_job = add_job(&mut ssn, "job-b", q2, 1);
        // The cheaper victim (priority 0) pops first but its node cannot
        // cover the request; the second node can
        let small = add_running_task(&mut ssn, victim_job, "small", "node-1", 1000.0, 0);
        let big = add_running_task(&mut ssn, victim_job, "big", "node-2", 2000.0, 5);

        let mut action = ReclaimAction::new();
        action.execute(&mut ssn);

        assert_eq!(ssn.jobs[&starving].tasks[&ta].status, TaskStatus::Pipelined);
        assert_eq!(
            ssn.jobs[&starving].tasks[&ta].node_name.as_deref(),
            Some("node-2")
        );
        assert_eq!(ssn.jobs[&victim_job].tasks[&big].status, TaskStatus::Releasing);
        // The failed first attempt was fully unwound
        assert_eq!(ssn.jobs[&victim_job].tasks[&small].status, TaskStatus::Running);
        assert!(ssn.nodes["node-1"].releasing.is_empty());
    }

    #[test]
    fn test_all_nodes_insufficient_changes_nothing() {
        let mut ssn = make_session();
        let q1 = add_queue(&mut ssn, "q1", true, 1);
        let q2 = add_queue(&mut ssn, "q2", true, 1);
        add_node(&mut ssn, "node-0", 0.0);

        let starving = add_job(&mut ssn, "job-a", q1, 1);
        let ta = add_pending_task(&mut ssn, starving, "ta", 2000.0);

        let victim_job = add_job(&mut ssn, "job-b", q2, 1);
        let tv = add_running_task(&mut ssn, victim_job, "tv", "node-0", 1000.0, 0);

        let mut action = ReclaimAction::new();
        action.execute(&mut ssn);

        assert_eq!(ssn.jobs[&starving].tasks[&ta].status, TaskStatus::Pending);
        assert_eq!(ssn.jobs[&victim_job].tasks[&tv].status, TaskStatus::Running);
        assert!(ssn.nodes["node-0"].releasing.is_empty());
    }

    #[test]
    fn test_preemption_policy_never_is_skipped() {
        let (mut ssn, starving, ta, victim_job, tv) = simple_cluster();
        ssn.jobs
            .get_mut(&starving)
            .unwrap()
            .tasks
            .get_mut(&ta)
            .unwrap()
            .preemption_policy = PreemptionPolicy::Never;

        let mut action = ReclaimAction::new();
        action.execute(&mut ssn);

        assert_eq!(ssn.jobs[&starving].tasks[&ta].status, TaskStatus::Pending);
        assert_eq!(ssn.jobs[&victim_job].tasks[&tv].status, TaskStatus::Running);
    }

    #[test]
    fn test_non_reclaimable_queue_blocks_reclaim() {
        let mut ssn = make_session();
        let q1 = add_queue(&mut ssn, "q1", true, 1);
        let q2 = add_queue(&mut ssn, "q2", false, 1);
        add_node(&mut ssn, "node-0", 0.0);

        let starving = add_job(&mut ssn, "job-a", q1, 1);
        let ta = add_pending_task(&mut ssn, starving, "ta", 2000.0);

        let victim_job = add_job(&mut ssn, "job-b", q2, 1);
        let tv = add_running_task(&mut ssn, victim_job, "tv", "node-0", 2000.0, 0);

        let mut action = ReclaimAction::new();
        action.execute(&mut ssn);

        assert_eq!(ssn.jobs[&starving].tasks[&ta].status, TaskStatus::Pending);
        assert_eq!(ssn.jobs[&victim_job].tasks[&tv].status, TaskStatus::Running);
        assert!(ssn.nodes["node-0"].releasing.is_empty());
    }

    #[test]
    fn test_overused_queue_is_ignored() {
        let (mut ssn, starving, ta, _, _) = simple_cluster();
        ssn.set_overused_fn(Arc::new(|queue| queue.name == "q1"));

        let mut action = ReclaimAction::new();
        action.execute(&mut ssn);

        assert_eq!(ssn.jobs[&starving].tasks[&ta].status, TaskStatus::Pending);
    }

    #[test]
    fn test_same_queue_tasks_are_not_victims() {
        let mut ssn = make_session();
        let q1 = add_queue(&mut ssn, "q1", true, 1);
        add_node(&mut ssn, "node-0", 0.0);

        let starving = add_job(&mut ssn, "job-a", q1, 1);
        let ta = add_pending_task(&mut ssn, starving, "ta", 2000.0);

        // Same-queue neighbor: never a reclaim victim
        let neighbor = add_job(&mut ssn, "job-b", q1, 1);
        let tv = add_running_task(&mut ssn, neighbor, "tv", "node-0", 2000.0, 0);

        let mut action = ReclaimAction::new();
        action.execute(&mut ssn);

        assert_eq!(ssn.jobs[&starving].tasks[&ta].status, TaskStatus::Pending);
        assert_eq!(ssn.jobs[&neighbor].tasks[&tv].status, TaskStatus::Running);
    }

    #[test]
    fn test_non_preemptable_victims_are_skipped() {
        let (mut ssn, starving, ta, victim_job, tv) = simple_cluster();
        ssn.jobs
            .get_mut(&victim_job)
            .unwrap()
            .tasks
            .get_mut(&tv)
            .unwrap()
            .preemptable = false;
        if let Some(copy) = ssn.nodes.get_mut("node-0").and_then(|n| n.tasks.get_mut(&tv)) {
            copy.preemptable = false;
        }

        let mut action = ReclaimAction::new();
        action.execute(&mut ssn);

        assert_eq!(ssn.jobs[&starving].tasks[&ta].status, TaskStatus::Pending);
        assert_eq!(ssn.jobs[&victim_job].tasks[&tv].status, TaskStatus::Running);
    }

    #[test]
    fn test_gang_victims_co_evict() {
        let mut ssn = make_session();
        let q1 = add_queue(&mut ssn, "q1", true, 1);
        let q2 = add_queue(&mut ssn, "q2", true, 1);
        add_node(&mut ssn, "node-0", 0.0);

        let starving = add_job(&mut ssn, "job-a", q1, 1);
        let ta = add_pending_task(&mut ssn, starving, "ta", 1000.0);

        let victim_job = add_job(&mut ssn, "job-b", q2, 1);
        let g1 = add_running_task(&mut ssn, victim_job, "g1", "node-0", 1000.0, 0);
        let g2 = add_running_task(&mut ssn, victim_job, "g2", "node-0", 1000.0, 5);
        annotate(&mut ssn, victim_job, g1, crate::gang::GROUP_EVICTION_MIN_MEMBER);
        annotate(&mut ssn, victim_job, g2, crate::gang::GROUP_EVICTION_MIN_MEMBER);

        let mut action = ReclaimAction::new();
        action.execute(&mut ssn);

        // One gang member suffices resource-wise, but evicting it drags
        // in the whole gang
        assert_eq!(ssn.jobs[&starving].tasks[&ta].status, TaskStatus::Pipelined);
        assert_eq!(ssn.jobs[&victim_job].tasks[&g1].status, TaskStatus::Releasing);
        assert_eq!(ssn.jobs[&victim_job].tasks[&g2].status, TaskStatus::Releasing);
    }

    #[test]
    fn test_pending_jobs_are_not_admitted() {
        let (mut ssn, starving, ta, _, _) = simple_cluster();
        ssn.jobs.get_mut(&starving).unwrap().phase = harvest_core::types::JobPhase::Pending;

        let mut action = ReclaimAction::new();
        action.execute(&mut ssn);

        assert_eq!(ssn.jobs[&starving].tasks[&ta].status, TaskStatus::Pending);
    }

    #[test]
    fn test_expired_deadline_stops_the_cycle() {
        let (mut ssn, starving, ta, _, _) = simple_cluster();
        ssn.deadline = Some(std::time::Instant::now() - std::time::Duration::from_secs(1));

        let mut action = ReclaimAction::new();
        action.execute(&mut ssn);

        assert_eq!(ssn.jobs[&starving].tasks[&ta].status, TaskStatus::Pending);
    }

    #[test]
    fn test_reclaimable_policy_filter_can_veto_victims() {
        let (mut ssn, starving, ta, victim_job, tv) = simple_cluster();
        ssn.set_reclaimable_fn(Arc::new(|_, _| Vec::new()));

        let mut action = ReclaimAction::new();
        action.execute(&mut ssn);

        assert_eq!(ssn.jobs[&starving].tasks[&ta].status, TaskStatus::Pending);
        assert_eq!(ssn.jobs[&victim_job].tasks[&tv].status, TaskStatus::Running);
    }

    #[test]
    fn test_failed_pre_predicate_skips_the_task() {
        let (mut ssn, starving, ta, victim_job, tv) = simple_cluster();
        ssn.set_pre_predicate_fn(Arc::new(|task| {
            Err(format!("task {} not ready for placement", task.name))
        }));

        let mut action = ReclaimAction::new();
        action.execute(&mut ssn);

        assert_eq!(ssn.jobs[&starving].tasks[&ta].status, TaskStatus::Pending);
        assert_eq!(ssn.jobs[&victim_job].tasks[&tv].status, TaskStatus::Running);
    }

    #[test]
    fn test_action_lifecycle_and_name() {
        let mut action = ReclaimAction::new();
        action.initialize();
        assert_eq!(action.name(), "reclaim");
        action.un_initialize();
    }
}
