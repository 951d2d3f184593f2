//! Deployer error types

use infraflow_cloud::CloudError;
use infraflow_core::{ErrorDetail, ErrorKind};
use infraflow_driver::DriverError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline step a deployment failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resolve,
    Credentials,
    Arguments,
    Prepare,
    Apply,
    Destroy,
    Output,
    Parse,
    Addons,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Resolve => "resolve",
            Stage::Credentials => "credentials",
            Stage::Arguments => "arguments",
            Stage::Prepare => "prepare",
            Stage::Apply => "apply",
            Stage::Destroy => "destroy",
            Stage::Output => "output",
            Stage::Parse => "parse",
            Stage::Addons => "addons",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failed deployment, tagged with the stage that failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{stage}] {kind}: {message}")]
pub struct DeployError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

impl DeployError {
    pub fn new(stage: Stage, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    pub fn cloud(stage: Stage, error: CloudError) -> Self {
        Self::new(stage, error.kind(), error.to_string())
    }

    pub fn driver(stage: Stage, error: DriverError) -> Self {
        Self::new(stage, error.kind(), error.to_string())
    }
}

impl From<DeployError> for ErrorDetail {
    fn from(error: DeployError) -> Self {
        ErrorDetail::new(error.kind, error.message).at_stage(error.stage.as_str())
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;
