use harvest_core::types::{JobInfo, TaskId};

/// Pod-metadata annotation declaring gang membership for eviction.
pub const GROUP_EVICTION_POLICY_ANNOTATION_KEY: &str = "group-eviction-policy";

/// The only annotation value that currently triggers co-eviction; any
/// other value is ignored for forward compatibility.
pub const GROUP_EVICTION_MIN_MEMBER: &str = "minMember";

/// Reason attached to eviction operations added by gang expansion.
pub const GROUP_EVICTION_REASON: &str = "group-eviction-policy";

fn is_gang_member(job: &JobInfo, task_id: TaskId) -> bool {
    job.tasks
        .get(&task_id)
        .and_then(|t| t.annotations.get(GROUP_EVICTION_POLICY_ANNOTATION_KEY))
        .is_some_and(|v| v == GROUP_EVICTION_MIN_MEMBER)
}

/// Tasks that must co-evict with `trigger`.
///
/// The policy is symmetric over the annotated set within one job: evicting
/// any annotated task drags in every annotated sibling, while evicting a
/// bare task drags in nobody. Annotation scope is the owning job; gangs
/// never cross job boundaries.
pub fn co_eviction_siblings(job: &JobInfo, trigger: TaskId) -> Vec<TaskId> {
    if !is_gang_member(job, trigger) {
        return Vec::new();
    }
    let mut siblings: Vec<TaskId> = job
        .tasks
        .keys()
        .copied()
        .filter(|id| *id != trigger && is_gang_member(job, *id))
        .collect();
    siblings.sort();
    siblings
}
