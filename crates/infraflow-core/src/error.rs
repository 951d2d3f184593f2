//! Error taxonomy shared by every InfraFlow crate

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure category recorded on entity status and task results.
///
/// Each crate keeps its own error enum; all of them map onto this set so a
/// failure keeps the same kind from the driver up to the entity status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A non-terminal task already exists for the entity
    Conflict,
    /// No configuration bundle matches the requested infra version
    UnsupportedVersion,
    /// Credential resolution failed or the material expired
    CredentialError,
    /// The IaC tool exited non-zero
    ExecutionError,
    /// The tool's structured output could not be parsed
    OutputParseError,
    /// A deadline elapsed before the operation finished
    Timeout,
    /// The parent entity is not `Active`
    ParentNotReady,
    /// Children must be deleted before their parent
    DependencyOrder,
    NotFound,
    InvalidSpec,
    /// The task queue or a deployer endpoint could not be reached
    Unavailable,
    Internal,
}

impl ErrorKind {
    /// Whether the controller may retry an attempt that failed with this kind.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::InvalidSpec | ErrorKind::NotFound)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Conflict => "conflict",
            ErrorKind::UnsupportedVersion => "unsupported_version",
            ErrorKind::CredentialError => "credential_error",
            ErrorKind::ExecutionError => "execution_error",
            ErrorKind::OutputParseError => "output_parse_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ParentNotReady => "parent_not_ready",
            ErrorKind::DependencyOrder => "dependency_order",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidSpec => "invalid_spec",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Core model and store errors
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Entity already exists: {0}")]
    EntityAlreadyExists(String),

    #[error("Invalid phase transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: crate::model::Phase,
        to: crate::model::Phase,
    },

    #[error("Entity {0} cannot be removed before it reaches Deleted")]
    NotDeleted(String),

    #[error("Parent not ready: {0}")]
    ParentNotReady(String),

    #[error("Dependency order violated: {0}")]
    DependencyOrder(String),

    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("KDL parse error: {0}")]
    KdlParse(#[from] kdl::KdlError),

    #[error("State file error: {0}")]
    StateError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::EntityNotFound(_) => ErrorKind::NotFound,
            CoreError::EntityAlreadyExists(_) => ErrorKind::Conflict,
            CoreError::InvalidTransition { .. } => ErrorKind::Conflict,
            CoreError::NotDeleted(_) | CoreError::DependencyOrder(_) => {
                ErrorKind::DependencyOrder
            }
            CoreError::ParentNotReady(_) => ErrorKind::ParentNotReady,
            CoreError::InvalidSpec(_) | CoreError::Manifest(_) | CoreError::KdlParse(_) => {
                ErrorKind::InvalidSpec
            }
            CoreError::StateError(_) | CoreError::Io(_) | CoreError::Json(_) => {
                ErrorKind::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
