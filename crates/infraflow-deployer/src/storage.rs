//! Storage deployer (buckets and managed file systems)

use crate::context::DeployContext;
use crate::error::Result;
use crate::service::{DeployerService, Deployment};
use crate::stack::{Stack, required_output};
use async_trait::async_trait;
use infraflow_core::{EntityKind, ResourceOutputs, StorageOutputs, TaskInfo};
use infraflow_driver::StackOutputs;

pub struct StorageDeployer {
    ctx: DeployContext,
}

impl StorageDeployer {
    pub fn new(ctx: DeployContext) -> Self {
        Self { ctx }
    }
}

fn parse(outputs: &StackOutputs) -> Result<StorageOutputs> {
    Ok(StorageOutputs {
        name: required_output(outputs, "name")?.to_string(),
        endpoint: outputs.string("endpoint").map(str::to_string),
    })
}

#[async_trait]
impl DeployerService for StorageDeployer {
    fn kind(&self) -> EntityKind {
        EntityKind::Storage
    }

    async fn create_or_update(&self, info: &TaskInfo) -> Result<Deployment> {
        let mut stack = Stack::open(&self.ctx, info, EntityKind::Storage).await?;
        let result: Result<Deployment> = async {
            let outputs = stack.apply().await?;
            let storage = parse(&outputs)?;
            tracing::info!("{}: storage {} ready", info.entity.id, storage.name);
            Ok(Deployment {
                outputs: outputs.public(),
                details: Some(ResourceOutputs::Storage(storage)),
                infra_version: stack.bundle().version.clone(),
            })
        }
        .await;
        stack.close(result.is_ok()).await;
        result
    }

    async fn destroy(&self, info: &TaskInfo) -> Result<Deployment> {
        let mut stack = Stack::open(&self.ctx, info, EntityKind::Storage).await?;
        let result = stack.destroy().await.map(|()| Deployment {
            outputs: Default::default(),
            details: None,
            infra_version: stack.bundle().version.clone(),
        });
        stack.close(result.is_ok()).await;
        result
    }
}
