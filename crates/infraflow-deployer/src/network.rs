//! Network deployer

use crate::context::DeployContext;
use crate::error::Result;
use crate::service::{DeployerService, Deployment};
use crate::stack::{Stack, required_output};
use async_trait::async_trait;
use infraflow_core::{EntityKind, NetworkOutputs, ResourceOutputs, TaskInfo};
use infraflow_driver::StackOutputs;

pub struct NetworkDeployer {
    ctx: DeployContext,
}

impl NetworkDeployer {
    pub fn new(ctx: DeployContext) -> Self {
        Self { ctx }
    }
}

fn parse(outputs: &StackOutputs) -> Result<NetworkOutputs> {
    Ok(NetworkOutputs {
        vpc_id: required_output(outputs, "vpc_id")?.to_string(),
        subnet_ids: outputs
            .values
            .get("subnet_ids")
            .and_then(|v| v.as_string_list())
            .unwrap_or_default(),
    })
}

#[async_trait]
impl DeployerService for NetworkDeployer {
    fn kind(&self) -> EntityKind {
        EntityKind::Network
    }

    async fn create_or_update(&self, info: &TaskInfo) -> Result<Deployment> {
        let mut stack = Stack::open(&self.ctx, info, EntityKind::Network).await?;
        let result: Result<Deployment> = async {
            let outputs = stack.apply().await?;
            let network = parse(&outputs)?;
            tracing::info!("{}: network {} ready", info.entity.id, network.vpc_id);
            Ok(Deployment {
                outputs: outputs.public(),
                details: Some(ResourceOutputs::Network(network)),
                infra_version: stack.bundle().version.clone(),
            })
        }
        .await;
        stack.close(result.is_ok()).await;
        result
    }

    async fn destroy(&self, info: &TaskInfo) -> Result<Deployment> {
        let mut stack = Stack::open(&self.ctx, info, EntityKind::Network).await?;
        let result = stack.destroy().await.map(|()| Deployment {
            outputs: Default::default(),
            details: None,
            infra_version: stack.bundle().version.clone(),
        });
        stack.close(result.is_ok()).await;
        result
    }
}
