//! Deployer service contract

use crate::error::Result;
use async_trait::async_trait;
use infraflow_core::{EntityKind, Outputs, ResourceOutputs, TaskInfo, TaskResult};

/// Successful outcome of a deployment
#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    /// Non-sensitive stack outputs
    pub outputs: Outputs,
    pub details: Option<ResourceOutputs>,
    /// Bundle version that was applied
    pub infra_version: String,
}

impl Deployment {
    pub fn into_result(self) -> TaskResult {
        TaskResult::succeeded(self.outputs, self.details, self.infra_version)
    }
}

/// One deployer per entity kind
#[async_trait]
pub trait DeployerService: Send + Sync {
    fn kind(&self) -> EntityKind;

    async fn create_or_update(&self, info: &TaskInfo) -> Result<Deployment>;

    async fn destroy(&self, info: &TaskInfo) -> Result<Deployment>;
}
