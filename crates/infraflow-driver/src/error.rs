//! Driver error types

use crate::driver::StackState;
use infraflow_core::{CloudType, EntityKind, ErrorKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("No configuration bundle for {cloud}/{version} ({kind}): {reason}")]
    UnsupportedVersion {
        cloud: CloudType,
        version: String,
        kind: EntityKind,
        reason: String,
    },

    #[error("Cannot {operation} a stack in state {state}")]
    InvalidState {
        operation: &'static str,
        state: StackState,
    },

    #[error("{command} exited with code {code}\n{tail}")]
    Execution {
        command: String,
        code: i32,
        tail: String,
    },

    #[error("{command} did not finish before its deadline")]
    Timeout { command: String },

    #[error("Output parse error: {0}")]
    OutputParse(String),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            DriverError::InvalidState { .. } | DriverError::Io(_) => ErrorKind::Internal,
            DriverError::Execution { .. } | DriverError::Spawn { .. } => ErrorKind::ExecutionError,
            DriverError::Timeout { .. } => ErrorKind::Timeout,
            DriverError::OutputParse(_) => ErrorKind::OutputParseError,
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
