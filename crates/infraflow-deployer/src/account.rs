//! Account deployer: credential resolution and identity check, no IaC run

use crate::context::DeployContext;
use crate::error::{DeployError, Result, Stage};
use crate::service::{DeployerService, Deployment};
use async_trait::async_trait;
use infraflow_core::{EntityKind, OutputValue, Outputs, ResourceOutputs, TaskInfo};

pub struct AccountDeployer {
    ctx: DeployContext,
}

impl AccountDeployer {
    pub fn new(ctx: DeployContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl DeployerService for AccountDeployer {
    fn kind(&self) -> EntityKind {
        EntityKind::Account
    }

    async fn create_or_update(&self, info: &TaskInfo) -> Result<Deployment> {
        let entity = &info.entity;
        let identity = self
            .ctx
            .providers
            .get(entity.spec.cloud)
            .verify_identity(&info.access, &entity.id)
            .await
            .map_err(|e| DeployError::cloud(Stage::Credentials, e))?;

        let mut outputs = Outputs::new();
        outputs.insert(
            "account_id".to_string(),
            OutputValue::String(identity.account_id.clone()),
        );
        Ok(Deployment {
            outputs,
            details: Some(ResourceOutputs::Account(identity)),
            infra_version: entity.spec.infra_version.clone(),
        })
    }

    /// Accounts own no infrastructure of their own
    async fn destroy(&self, info: &TaskInfo) -> Result<Deployment> {
        tracing::info!("{}: releasing account", info.entity.id);
        Ok(Deployment {
            outputs: Outputs::new(),
            details: None,
            infra_version: info.entity.spec.infra_version.clone(),
        })
    }
}
