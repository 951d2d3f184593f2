//! Control plane error types

use infraflow_core::{CoreError, ErrorKind, TaskState};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Entity {entity} already has task {task} in flight")]
    Conflict { entity: String, task: Uuid },

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Task {task} is no longer leased to {worker}")]
    LeaseLost { task: Uuid, worker: String },

    #[error("Task {task} is {state}, cannot {action}")]
    InvalidTaskState {
        task: Uuid,
        state: TaskState,
        action: &'static str,
    },

    #[error("Dependency order violated: {0}")]
    DependencyOrder(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Deployer unavailable: {0}")]
    Unavailable(String),
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::Core(e) => e.kind(),
            ControlError::Conflict { .. }
            | ControlError::LeaseLost { .. }
            | ControlError::InvalidTaskState { .. } => ErrorKind::Conflict,
            ControlError::TaskNotFound(_) => ErrorKind::NotFound,
            ControlError::DependencyOrder(_) => ErrorKind::DependencyOrder,
            ControlError::InvalidRequest(_) => ErrorKind::InvalidSpec,
            ControlError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
