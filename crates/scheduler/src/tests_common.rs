use harvest_core::resource::Resource;
use harvest_core::types::{JobId, JobInfo, NodeInfo, QueueId, QueueInfo, TaskId, TaskInfo, TaskStatus};

use crate::gang::GROUP_EVICTION_POLICY_ANNOTATION_KEY;
use crate::session::Session;

pub fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

pub fn make_session() -> Session {
    let mut ssn = Session::new();
    ssn.shard_count = 2;
    ssn
}

pub fn add_queue(ssn: &mut Session, name: &str, reclaimable: bool, weight: u32) -> QueueId {
    let queue = QueueInfo::new(name, reclaimable, weight);
    let id = queue.id;
    ssn.queues.insert(id, queue);
    id
}

pub fn add_job(ssn: &mut Session, name: &str, queue: QueueId, min_available: u32) -> JobId {
    let mut job = JobInfo::new("default", name, queue);
    job.min_available = min_available;
    let id = job.id;
    ssn.jobs.insert(id, job);
    id
}

pub fn add_node(ssn: &mut Session, name: &str, idle_cpu: f64) {
    ssn.nodes
        .insert(name.to_string(), NodeInfo::new(name, Resource::new(idle_cpu, 0.0)));
}

pub fn add_pending_task(ssn: &mut Session, job: JobId, name: &str, cpu: f64) -> TaskId {
    let task = TaskInfo::new(name, job, TaskStatus::Pending, Resource::new(cpu, 0.0));
    let id = task.id;
    ssn.jobs.get_mut(&job).unwrap().add_task(task);
    id
}

pub fn add_running_task(
    ssn: &mut Session,
    job: JobId,
    name: &str,
    node: &str,
    cpu: f64,
    priority: u32,
) -> TaskId {
    let mut task = TaskInfo::new(name, job, TaskStatus::Running, Resource::new(cpu, 0.0));
    task.node_name = Some(node.to_string());
    task.priority = priority;
    let id = task.id;
    ssn.nodes
        .get_mut(node)
        .unwrap()
        .tasks
        .insert(id, task.clone());
    ssn.jobs.get_mut(&job).unwrap().add_task(task);
    id
}

/// Set the gang annotation on a task, syncing any node copy.
pub fn annotate(ssn: &mut Session, job: JobId, task: TaskId, value: &str) {
    let entry = ssn
        .jobs
        .get_mut(&job)
        .unwrap()
        .tasks
        .get_mut(&task)
        .unwrap();
    entry
        .annotations
        .insert(GROUP_EVICTION_POLICY_ANNOTATION_KEY.to_string(), value.to_string());
    let node_name = entry.node_name.clone();
    if let Some(name) = node_name {
        if let Some(copy) = ssn.nodes.get_mut(&name).and_then(|n| n.tasks.get_mut(&task)) {
            copy.annotations
                .insert(GROUP_EVICTION_POLICY_ANNOTATION_KEY.to_string(), value.to_string());
        }
    }
}

/// Standalone task construction for modules that don't need a session.
pub fn annotated_task(name: &str, job: JobId, value: &str) -> TaskInfo {
    let mut task = TaskInfo::new(name, job, TaskStatus::Running, Resource::zero());
    task.annotations
        .insert(GROUP_EVICTION_POLICY_ANNOTATION_KEY.to_string(), value.to_string());
    task
}
