use thiserror::Error;

use crate::types::{TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("insufficient resource: {0}")]
    InsufficientResource(String),

    #[error("unknown node {name}")]
    UnknownNode { name: String },

    #[error("unknown job for task {0}")]
    UnknownJob(TaskId),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {0} is scheduling-gated")]
    TaskGated(TaskId),

    #[error("task {task} is already terminal ({status})")]
    TaskTerminal { task: TaskId, status: TaskStatus },

    #[error("task {task} is already placed on node {node} in this statement")]
    AlreadyPlaced { task: TaskId, node: String },

    #[error("statement already committed")]
    StatementCommitted,

    #[error("no eviction victims on node {name}")]
    NoVictims { name: String },

    #[error("invalid victim: {0}")]
    InvalidVictim(String),
}
