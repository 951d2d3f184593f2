//! Task RPC seam between workers and deployer services

use crate::account::AccountDeployer;
use crate::cluster::ClusterDeployer;
use crate::context::DeployContext;
use crate::network::NetworkDeployer;
use crate::service::DeployerService;
use crate::storage::StorageDeployer;
use async_trait::async_trait;
use infraflow_core::{EntityKind, ErrorDetail, ErrorKind, Operation, TaskInfo, TaskResult};
use std::collections::BTreeMap;
use std::sync::Arc;

/// `RunTask(TaskInfo) -> TaskResult`
///
/// Implementations never fail at the call level: transport or dispatch
/// problems come back as a failed [`TaskResult`].
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, info: TaskInfo) -> TaskResult;
}

/// In-process runner dispatching on entity kind
pub struct DeployerRouter {
    services: BTreeMap<EntityKind, Arc<dyn DeployerService>>,
}

impl DeployerRouter {
    /// Router with the four built-in deployers
    pub fn new(ctx: DeployContext) -> Self {
        Self::empty()
            .with_service(Arc::new(AccountDeployer::new(ctx.clone())))
            .with_service(Arc::new(NetworkDeployer::new(ctx.clone())))
            .with_service(Arc::new(ClusterDeployer::new(ctx.clone())))
            .with_service(Arc::new(StorageDeployer::new(ctx)))
    }

    pub fn empty() -> Self {
        Self {
            services: BTreeMap::new(),
        }
    }

    /// Register (or replace) the deployer for a kind
    pub fn with_service(mut self, service: Arc<dyn DeployerService>) -> Self {
        self.services.insert(service.kind(), service);
        self
    }
}

#[async_trait]
impl TaskRunner for DeployerRouter {
    async fn run_task(&self, info: TaskInfo) -> TaskResult {
        let kind = info.entity.kind();
        let Some(service) = self.services.get(&kind) else {
            return TaskResult::failed(ErrorDetail::new(
                ErrorKind::Internal,
                format!("no deployer registered for {}", kind),
            ));
        };

        tracing::info!(
            "Task {}: {} {} (attempt {})",
            info.task_id,
            info.operation,
            info.entity.id,
            info.attempt
        );

        let outcome = match info.operation {
            Operation::CreateOrUpdate => service.create_or_update(&info).await,
            Operation::Destroy => service.destroy(&info).await,
        };

        match outcome {
            Ok(deployment) => deployment.into_result(),
            Err(error) => {
                tracing::warn!("Task {}: {} failed: {}", info.task_id, info.entity.id, error);
                TaskResult::failed(error.into())
            }
        }
    }
}
