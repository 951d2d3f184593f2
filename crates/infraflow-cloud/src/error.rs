//! Variable provider error types

use infraflow_core::{CloudType, ErrorKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("{0} CLI not found. Please install it or set credentials.aws-cli")]
    CliNotFound(String),

    #[error("Credential resolution failed: {0}")]
    Credential(String),

    #[error("Credentials are for {found}, provider is {expected}")]
    CloudMismatch { expected: CloudType, found: CloudType },

    #[error("State backend for {0} is not configured: {1}")]
    BackendNotConfigured(CloudType, String),

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CloudError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CloudError::CliNotFound(_)
            | CloudError::Credential(_)
            | CloudError::CloudMismatch { .. }
            | CloudError::CommandFailed(_)
            | CloudError::Json(_) => ErrorKind::CredentialError,
            CloudError::BackendNotConfigured(..) | CloudError::Io(_) => ErrorKind::Internal,
            CloudError::MissingInput(_) => ErrorKind::ParentNotReady,
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
