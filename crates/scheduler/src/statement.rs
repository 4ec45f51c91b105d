use tracing::{debug, error};

use harvest_core::error::CoreError;
use harvest_core::resource::SubMode;
use harvest_core::types::{JobId, TaskId, TaskInfo, TaskStatus};

use crate::gang;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Evict,
    Pipeline,
    Allocate,
}

/// One tentative scheduling operation in a statement's log.
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OpKind,
    pub task: TaskId,
    pub job: JobId,
    pub node: Option<String>,
    pub reason: String,
    pub seq: u64,
    /// Target's status when the operation was appended; discard restores it.
    pub prior_status: TaskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementState {
    Pending,
    Committed,
    Discarded,
}

/// Anything exposing a readable operation log; lets `save_operations`
/// mix statements and prior snapshots in one call.
pub trait OperationLog {
    fn operations(&self) -> &[Operation];
}

/// Immutable copy of one or more operation logs.
#[derive(Debug, Clone, Default)]
pub struct OperationSnapshot {
    ops: Vec<Operation>,
}

impl OperationSnapshot {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl OperationLog for OperationSnapshot {
    fn operations(&self) -> &[Operation] {
        &self.ops
    }
}

/// Concatenate the operation logs of zero or more statements (or earlier
/// snapshots) left-to-right into an immutable snapshot. Ordering within
/// each input is preserved.
pub fn save_operations(parts: &[&dyn OperationLog]) -> OperationSnapshot {
    let mut ops = Vec::new();
    for part in parts {
        ops.extend(part.operations().iter().cloned());
    }
    OperationSnapshot { ops }
}

/// Append-only log of tentative scheduling operations against a session.
///
/// Appending an operation applies its status effect to the session right
/// away (evicted tasks move to Releasing, placed tasks to
/// Pipelined/Binding) so mid-cycle policy queries observe tentative
/// placements. `discard` unwinds those effects in reverse; `commit`
/// settles the resource accounting and dispatches to the registered
/// commit sinks, exactly once.
pub struct Statement {
    ops: Vec<Operation>,
    state: StatementState,
    next_seq: u64,
}

impl Statement {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            state: StatementState::Pending,
            next_seq: 0,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.state == StatementState::Committed
    }

    pub fn is_discarded(&self) -> bool {
        self.state == StatementState::Discarded
    }

    fn contains_evict(&self, task: TaskId) -> bool {
        self.ops
            .iter()
            .any(|op| op.kind == OpKind::Evict && op.task == task)
    }

    fn push_op(&mut self, mut op: Operation) {
        op.seq = self.next_seq;
        self.next_seq += 1;
        self.ops.push(op);
    }

    /// Append an eviction for `task`, then broaden it to the task's
    /// co-eviction gang. Idempotent per task within one statement.
    ///
    /// Fails only if a target is already terminal or scheduling-gated.
    pub fn evict(
        &mut self,
        ssn: &mut Session,
        task: &TaskInfo,
        reason: &str,
    ) -> Result<(), CoreError> {
        if self.contains_evict(task.id) {
            return Ok(());
        }
        let job = ssn
            .jobs
            .get(&task.job)
            .ok_or(CoreError::UnknownJob(task.id))?;
        let siblings = gang::co_eviction_siblings(job, task.id);

        self.apply_evict(ssn, task.id, task.job, reason)?;
        for sibling in siblings {
            if self.contains_evict(sibling) {
                continue;
            }
            self.apply_evict(ssn, sibling, task.job, gang::GROUP_EVICTION_REASON)?;
        }
        Ok(())
    }

    fn apply_evict(
        &mut self,
        ssn: &mut Session,
        task_id: TaskId,
        job_id: JobId,
        reason: &str,
    ) -> Result<(), CoreError> {
        let job = ssn
            .jobs
            .get_mut(&job_id)
            .ok_or(CoreError::UnknownJob(task_id))?;
        let target = job.tasks.get(&task_id).ok_or(CoreError::UnknownTask(task_id))?;
        if target.sched_gated {
            return Err(CoreError::TaskGated(task_id));
        }
        if target.status.is_terminal() {
            return Err(CoreError::TaskTerminal {
                task: task_id,
                status: target.status,
            });
        }
        let node_name = target.node_name.clone();
        let prior = job.update_task_status(task_id, TaskStatus::Releasing)?;
        if let Some(name) = &node_name {
            if let Some(node) = ssn.nodes.get_mut(name) {
                if let Some(copy) = node.tasks.get_mut(&task_id) {
                    copy.status = TaskStatus::Releasing;
                }
            }
        }
        debug!("Evicting task {} (reason: {})", task_id, reason);
        self.push_op(Operation {
            kind: OpKind::Evict,
            task: task_id,
            job: job_id,
            node: node_name,
            reason: reason.to_string(),
            seq: 0,
            prior_status: prior,
        });
        Ok(())
    }

    /// Tentatively place `task` on `node_name`. With `eviction_occurred`
    /// the bind is deferred until the evicted resources actually release;
    /// without it this is a plain allocation.
    pub fn pipeline(
        &mut self,
        ssn: &mut Session,
        task: &TaskInfo,
        node_name: &str,
        eviction_occurred: bool,
    ) -> Result<(), CoreError> {
        if !ssn.nodes.contains_key(node_name) {
            return Err(CoreError::UnknownNode {
                name: node_name.to_string(),
            });
        }
        if let Some(prior) = self
            .ops
            .iter()
            .find(|op| op.kind != OpKind::Evict && op.task == task.id)
        {
            return Err(CoreError::AlreadyPlaced {
                task: task.id,
                node: prior.node.clone().unwrap_or_default(),
            });
        }

        let (kind, status) = if eviction_occurred {
            (OpKind::Pipeline, TaskStatus::Pipelined)
        } else {
            (OpKind::Allocate, TaskStatus::Binding)
        };

        let job = ssn
            .jobs
            .get_mut(&task.job)
            .ok_or(CoreError::UnknownJob(task.id))?;
        let prior = job.update_task_status(task.id, status)?;
        let placed = match job.tasks.get_mut(&task.id) {
            Some(t) => {
                t.node_name = Some(node_name.to_string());
                t.clone()
            }
            None => return Err(CoreError::UnknownTask(task.id)),
        };
        if let Some(node) = ssn.nodes.get_mut(node_name) {
            node.tasks.insert(task.id, placed);
        }
        debug!(
            "Placing task {} on node {} ({:?})",
            task.name, node_name, kind
        );
        self.push_op(Operation {
            kind,
            task: task.id,
            job: task.job,
            node: Some(node_name.to_string()),
            reason: String::new(),
            seq: 0,
            prior_status: prior,
        });
        Ok(())
    }

    /// Convenience for the no-eviction path.
    pub fn allocate(
        &mut self,
        ssn: &mut Session,
        task: &TaskInfo,
        node_name: &str,
    ) -> Result<(), CoreError> {
        self.pipeline(ssn, task, node_name, false)
    }

    /// Release tentative reservations and mark the statement dead.
    pub fn discard(&mut self, ssn: &mut Session) {
        if self.state == StatementState::Committed {
            error!("Refusing to discard a committed statement");
            return;
        }
        debug!("Discarding statement with {} operations", self.ops.len());
        for op in self.ops.iter().rev() {
            unwind_op(ssn, op);
        }
        self.ops.clear();
        self.state = StatementState::Discarded;
    }

    /// Settle every operation against the session: resource accounting
    /// in log order, then dispatch through the commit sinks. All-or-
    /// nothing with respect to this statement; earlier committed
    /// statements are never rolled back.
    pub fn commit(&mut self, ssn: &mut Session) -> Result<(), CoreError> {
        if self.state != StatementState::Pending {
            return Err(CoreError::StatementCommitted);
        }
        for op in &self.ops {
            match op.kind {
                OpKind::Evict => {
                    let resreq = ssn
                        .jobs
                        .get(&op.job)
                        .and_then(|j| j.tasks.get(&op.task))
                        .map(|t| t.resreq.clone());
                    if let Some(resreq) = resreq {
                        if let Some(name) = &op.node {
                            if let Some(node) = ssn.nodes.get_mut(name) {
                                node.releasing.add(&resreq);
                            }
                        }
                        if let Some(job) = ssn.jobs.get_mut(&op.job) {
                            let _ = job.allocated.sub(&resreq, SubMode::Saturating);
                        }
                    }
                    dispatch_evict(ssn, op);
                }
                OpKind::Allocate => {
                    let resreq = ssn
                        .jobs
                        .get(&op.job)
                        .and_then(|j| j.tasks.get(&op.task))
                        .map(|t| t.resreq.clone());
                    if let Some(resreq) = resreq {
                        if let Some(name) = &op.node {
                            if let Some(node) = ssn.nodes.get_mut(name) {
                                let _ = node.idle.sub(&resreq, SubMode::Saturating);
                            }
                        }
                        if let Some(job) = ssn.jobs.get_mut(&op.job) {
                            job.allocated.add(&resreq);
                        }
                    }
                    dispatch_bind(ssn, op);
                }
                // Bind deferred until the reclaimed resources release
                OpKind::Pipeline => {}
            }
        }
        debug!("Committed statement with {} operations", self.ops.len());
        self.state = StatementState::Committed;
        Ok(())
    }

    /// Replace this statement's log with a saved snapshot, keeping the
    /// session's tentative state consistent with the restored log.
    /// Commit-time effects are never replayed here; they happen exactly
    /// once, at commit. Fails if the statement has already committed.
    pub fn recover_operations(
        &mut self,
        ssn: &mut Session,
        snapshot: &OperationSnapshot,
    ) -> Result<(), CoreError> {
        if self.state == StatementState::Committed {
            return Err(CoreError::StatementCommitted);
        }
        for op in self.ops.iter().rev() {
            unwind_op(ssn, op);
        }
        self.ops.clear();
        self.next_seq = 0;
        for op in snapshot.operations() {
            self.replay_op(ssn, op)?;
        }
        self.state = StatementState::Pending;
        Ok(())
    }

    fn replay_op(&mut self, ssn: &mut Session, op: &Operation) -> Result<(), CoreError> {
        match op.kind {
            OpKind::Evict => {
                let job = ssn
                    .jobs
                    .get_mut(&op.job)
                    .ok_or(CoreError::UnknownJob(op.task))?;
                job.update_task_status(op.task, TaskStatus::Releasing)?;
                if let Some(name) = &op.node {
                    if let Some(node) = ssn.nodes.get_mut(name) {
                        if let Some(copy) = node.tasks.get_mut(&op.task) {
                            copy.status = TaskStatus::Releasing;
                        }
                    }
                }
            }
            OpKind::Pipeline | OpKind::Allocate => {
                let status = if op.kind == OpKind::Pipeline {
                    TaskStatus::Pipelined
                } else {
                    TaskStatus::Binding
                };
                let job = ssn
                    .jobs
                    .get_mut(&op.job)
                    .ok_or(CoreError::UnknownJob(op.task))?;
                job.update_task_status(op.task, status)?;
                let placed = match job.tasks.get_mut(&op.task) {
                    Some(t) => {
                        t.node_name = op.node.clone();
                        t.clone()
                    }
                    None => return Err(CoreError::UnknownTask(op.task)),
                };
                if let Some(name) = &op.node {
                    if let Some(node) = ssn.nodes.get_mut(name) {
                        node.tasks.insert(op.task, placed);
                    }
                }
            }
        }
        let mut restored = op.clone();
        restored.seq = 0;
        self.push_op(restored);
        Ok(())
    }
}

impl OperationLog for Statement {
    fn operations(&self) -> &[Operation] {
        &self.ops
    }
}

impl Default for Statement {
    fn default() -> Self {
        Self::new()
    }
}

fn unwind_op(ssn: &mut Session, op: &Operation) {
    match op.kind {
        OpKind::Evict => {
            if let Some(job) = ssn.jobs.get_mut(&op.job) {
                let _ = job.update_task_status(op.task, op.prior_status);
            }
            if let Some(name) = &op.node {
                if let Some(node) = ssn.nodes.get_mut(name) {
                    if let Some(copy) = node.tasks.get_mut(&op.task) {
                        copy.status = op.prior_status;
                    }
                }
            }
        }
        OpKind::Pipeline | OpKind::Allocate => {
            if let Some(job) = ssn.jobs.get_mut(&op.job) {
                let _ = job.update_task_status(op.task, op.prior_status);
                if let Some(t) = job.tasks.get_mut(&op.task) {
                    t.node_name = None;
                }
            }
            if let Some(name) = &op.node {
                if let Some(node) = ssn.nodes.get_mut(name) {
                    node.tasks.remove(&op.task);
                }
            }
        }
    }
}

fn dispatch_evict(ssn: &Session, op: &Operation) {
    if let Some(task) = ssn.jobs.get(&op.job).and_then(|j| j.tasks.get(&op.task)) {
        for sinks in ssn.sinks() {
            if let Some(f) = &sinks.on_evict {
                f(task, &op.reason);
            }
        }
    }
}

fn dispatch_bind(ssn: &Session, op: &Operation) {
    let Some(node) = op.node.as_deref() else {
        return;
    };
    if let Some(task) = ssn.jobs.get(&op.job).and_then(|j| j.tasks.get(&op.task)) {
        for sinks in ssn.sinks() {
            if let Some(f) = &sinks.on_bind {
                f(task, node);
            }
        }
    }
}
