use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::resource::Resource;

pub type TaskId = Uuid;
pub type JobId = Uuid;
pub type QueueId = Uuid;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    /// Logically placed on a node; the physical bind waits for resources
    /// already marked for release.
    Pipelined,
    Binding,
    Bound,
    Running,
    Allocated,
    Releasing,
    Succeeded,
    Failed,
}

impl TaskStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Statuses that count against a job's minimum-member contract.
    pub fn is_occupied(self) -> bool {
        matches!(
            self,
            TaskStatus::Pipelined
                | TaskStatus::Binding
                | TaskStatus::Bound
                | TaskStatus::Running
                | TaskStatus::Allocated
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Pipelined => write!(f, "Pipelined"),
            Self::Binding => write!(f, "Binding"),
            Self::Bound => write!(f, "Bound"),
            Self::Running => write!(f, "Running"),
            Self::Allocated => write!(f, "Allocated"),
            Self::Releasing => write!(f, "Releasing"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PreemptionPolicy {
    Never,
    #[default]
    PreemptLowerPriority,
}

impl std::fmt::Display for PreemptionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => write!(f, "Never"),
            Self::PreemptLowerPriority => write!(f, "PreemptLowerPriority"),
        }
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub job: JobId,
    pub status: TaskStatus,
    /// Currently requested resources.
    pub resreq: Resource,
    /// Resources requested at submission, before any in-place resize.
    pub init_resreq: Resource,
    pub preemptable: bool,
    pub preemption_policy: PreemptionPolicy,
    /// Held back by a scheduling gate; not eligible for placement yet.
    pub sched_gated: bool,
    pub priority: u32,
    pub node_name: Option<String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl TaskInfo {
    pub fn new(name: &str, job: JobId, status: TaskStatus, resreq: Resource) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            job,
            status,
            init_resreq: resreq.clone(),
            resreq,
            preemptable: true,
            preemption_policy: PreemptionPolicy::default(),
            sched_gated: false,
            priority: 0,
            node_name: None,
            annotations: HashMap::new(),
        }
    }
}

/// Admission phase of a job, as reported by the surrounding scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Inqueue,
    Running,
    Completed,
    Aborted,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Inqueue => write!(f, "Inqueue"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// A job and its tasks, with a status index kept consistent through
/// `update_task_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub namespace: String,
    pub name: String,
    pub queue: QueueId,
    pub phase: JobPhase,
    /// Minimum number of occupied tasks for the job to make progress.
    pub min_available: u32,
    pub tasks: HashMap<TaskId, TaskInfo>,
    status_index: HashMap<TaskStatus, HashSet<TaskId>>,
    pub total_request: Resource,
    pub allocated: Resource,
}

impl JobInfo {
    pub fn new(namespace: &str, name: &str, queue: QueueId) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            queue,
            phase: JobPhase::Running,
            min_available: 1,
            tasks: HashMap::new(),
            status_index: HashMap::new(),
            total_request: Resource::zero(),
            allocated: Resource::zero(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.phase == JobPhase::Pending
    }

    /// Register a task, updating the status index and resource totals.
    pub fn add_task(&mut self, task: TaskInfo) {
        self.total_request.add(&task.resreq);
        if task.status.is_occupied() {
            self.allocated.add(&task.resreq);
        }
        self.status_index
            .entry(task.status)
            .or_default()
            .insert(task.id);
        self.tasks.insert(task.id, task);
    }

    /// Move a task to a new status, keeping the index consistent.
    /// Returns the prior status.
    pub fn update_task_status(
        &mut self,
        task_id: TaskId,
        status: TaskStatus,
    ) -> Result<TaskStatus, CoreError> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(CoreError::UnknownTask(task_id))?;
        let prior = task.status;
        task.status = status;
        if let Some(set) = self.status_index.get_mut(&prior) {
            set.remove(&task_id);
        }
        self.status_index.entry(status).or_default().insert(task_id);
        Ok(prior)
    }

    /// Task ids currently in `status`, sorted for deterministic iteration.
    pub fn task_ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .status_index
            .get(&status)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn pending_task_count(&self) -> usize {
        self.status_index
            .get(&TaskStatus::Pending)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// Tasks in statuses that count toward the minimum-member contract.
    pub fn occupied_task_count(&self) -> usize {
        self.status_index
            .iter()
            .filter(|(status, _)| status.is_occupied())
            .map(|(_, set)| set.len())
            .sum()
    }
}

/// A pool of peer jobs sharing one entitlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    pub id: QueueId,
    pub name: String,
    /// Whether this queue's tasks may be evicted to satisfy another
    /// queue's entitlement.
    pub reclaimable: bool,
    pub weight: u32,
}

impl QueueInfo {
    pub fn new(name: &str, reclaimable: bool, weight: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            reclaimable,
            weight,
        }
    }
}

/// A node and the tasks currently placed on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub schedulable: bool,
    pub tasks: HashMap<TaskId, TaskInfo>,
    /// Resources free right now.
    pub idle: Resource,
    /// Resources of tasks already marked for release this cycle.
    pub releasing: Resource,
}

impl NodeInfo {
    pub fn new(name: &str, idle: Resource) -> Self {
        Self {
            name: name.to_string(),
            schedulable: true,
            tasks: HashMap::new(),
            idle,
            releasing: Resource::zero(),
        }
    }

    /// What will be free once in-flight releases complete.
    pub fn future_idle(&self) -> Resource {
        let mut r = self.idle.clone();
        r.add(&self.releasing);
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Tolerance;

    #[test]
    fn test_status_index_follows_updates() {
        let queue = Uuid::new_v4();
        let mut job = JobInfo::new("default", "job-a", queue);
        let task = TaskInfo::new("t0", job.id, TaskStatus::Pending, Resource::new(100.0, 0.0));
        let task_id = task.id;
        job.add_task(task);

        assert_eq!(job.pending_task_count(), 1);
        assert_eq!(job.occupied_task_count(), 0);

        let prior = job.update_task_status(task_id, TaskStatus::Pipelined).unwrap();
        assert_eq!(prior, TaskStatus::Pending);
        assert_eq!(job.pending_task_count(), 0);
        assert_eq!(job.occupied_task_count(), 1);
        assert_eq!(job.tasks[&task_id].status, TaskStatus::Pipelined);
    }

    #[test]
    fn test_update_unknown_task_fails() {
        let mut job = JobInfo::new("default", "job-a", Uuid::new_v4());
        assert!(job
            .update_task_status(Uuid::new_v4(), TaskStatus::Running)
            .is_err());
    }

    #[test]
    fn test_add_task_accumulates_requests() {
        let mut job = JobInfo::new("default", "job-a", Uuid::new_v4());
        job.add_task(TaskInfo::new(
            "t0",
            job.id,
            TaskStatus::Pending,
            Resource::new(100.0, 0.0),
        ));
        job.add_task(TaskInfo::new(
            "t1",
            job.id,
            TaskStatus::Running,
            Resource::new(200.0, 0.0),
        ));

        assert_eq!(job.total_request.cpu_milli, 300.0);
        // Only the running task counts as allocated
        assert_eq!(job.allocated.cpu_milli, 200.0);
    }

    #[test]
    fn test_future_idle_includes_releasing() {
        let mut node = NodeInfo::new("node-0", Resource::new(1000.0, 0.0));
        node.releasing.add(&Resource::new(500.0, 0.0));

        let expected = Resource::new(1500.0, 0.0);
        assert!(node.future_idle().less_equal(&expected, Tolerance::Exact));
        assert!(expected.less_equal(&node.future_idle(), Tolerance::Exact));
    }
}
