use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FarmError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Prop not found: {0}")]
    PropNotFound(String),

    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Revision conflict on prop {name}: expected {expected}, stored {actual}")]
    Conflict {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("Node {node_id} no longer holds the lease on task {task_id}")]
    StaleOwner { task_id: Uuid, node_id: String },

    #[error("Job queue is at capacity ({0} jobs)")]
    QueueFull(usize),
}

impl FarmError {
    /// Stable machine-readable code reported to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            FarmError::JobNotFound(_)
            | FarmError::TaskNotFound(_)
            | FarmError::NodeNotFound(_)
            | FarmError::PropNotFound(_) => "not_found",
            FarmError::InvalidTransition { .. } => "invalid_transition",
            FarmError::Validation(_) => "validation_error",
            FarmError::Conflict { .. } => "conflict",
            FarmError::StaleOwner { .. } => "stale_owner",
            FarmError::QueueFull(_) => "queue_full",
        }
    }

    pub fn invalid_transition(
        id: impl ToString,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        FarmError::InvalidTransition {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FarmError>;
