//! Kubernetes cluster deployer

use crate::addons::AddonRequest;
use crate::context::DeployContext;
use crate::error::{DeployError, Result, Stage};
use crate::service::{DeployerService, Deployment};
use crate::stack::{Stack, required_output};
use async_trait::async_trait;
use infraflow_core::{
    ClusterOutputs, EntityKind, ErrorKind, ResourceOutputs, ResourceSpec, TaskInfo,
};
use infraflow_driver::StackOutputs;

/// Sensitive output holding the short-lived bearer token for add-ons
const TOKEN_OUTPUT: &str = "cluster_token";

pub struct ClusterDeployer {
    ctx: DeployContext,
}

impl ClusterDeployer {
    pub fn new(ctx: DeployContext) -> Self {
        Self { ctx }
    }
}

fn parse(outputs: &StackOutputs, fallback_name: &str) -> Result<ClusterOutputs> {
    Ok(ClusterOutputs {
        cluster_name: outputs
            .string("cluster_name")
            .unwrap_or(fallback_name)
            .to_string(),
        endpoint: required_output(outputs, "endpoint")?.to_string(),
        ca_certificate: outputs.string("ca_certificate").map(str::to_string),
        addons: Vec::new(),
    })
}

#[async_trait]
impl DeployerService for ClusterDeployer {
    fn kind(&self) -> EntityKind {
        EntityKind::Kubernetes
    }

    async fn create_or_update(&self, info: &TaskInfo) -> Result<Deployment> {
        let ResourceSpec::Kubernetes(spec) = &info.entity.spec.resource else {
            return Err(DeployError::new(
                Stage::Resolve,
                ErrorKind::InvalidSpec,
                format!("{} is not a kubernetes entity", info.entity.id),
            ));
        };

        let mut stack = Stack::open(&self.ctx, info, EntityKind::Kubernetes).await?;
        let result: Result<Deployment> = async {
            let outputs = stack.apply().await?;
            let mut cluster = parse(&outputs, &info.entity.metadata.name)?;

            cluster.addons = self
                .ctx
                .addons
                .install(AddonRequest {
                    cluster: &cluster,
                    token: outputs.string(TOKEN_OUTPUT),
                    addons: spec.addons.enabled(),
                    manifests_dir: &stack.bundle().addons_dir,
                    work_dir: stack.work_dir(),
                    deadline: deadline_instant(info),
                })
                .await?;

            tracing::info!(
                "{}: cluster {} ready at {}",
                info.entity.id,
                cluster.cluster_name,
                cluster.endpoint
            );
            Ok(Deployment {
                outputs: outputs.public(),
                details: Some(ResourceOutputs::Kubernetes(cluster)),
                infra_version: stack.bundle().version.clone(),
            })
        }
        .await;
        stack.close(result.is_ok()).await;
        result
    }

    async fn destroy(&self, info: &TaskInfo) -> Result<Deployment> {
        let mut stack = Stack::open(&self.ctx, info, EntityKind::Kubernetes).await?;
        let result = stack.destroy().await.map(|()| Deployment {
            outputs: Default::default(),
            details: None,
            infra_version: stack.bundle().version.clone(),
        });
        stack.close(result.is_ok()).await;
        result
    }
}

fn deadline_instant(info: &TaskInfo) -> tokio::time::Instant {
    let remaining = (info.deadline - chrono::Utc::now())
        .to_std()
        .unwrap_or_default();
    tokio::time::Instant::now() + remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use infraflow_driver::parse_outputs;

    #[test]
    fn test_parse_cluster_outputs() {
        let outputs = parse_outputs(
            r#"{
                "endpoint": {"value": "https://k8s.example:6443"},
                "ca_certificate": {"value": "Q0E="},
                "cluster_token": {"value": "tok", "sensitive": true}
            }"#,
        )
        .unwrap();
        let cluster = parse(&outputs, "prod").unwrap();
        assert_eq!(cluster.cluster_name, "prod");
        assert_eq!(cluster.endpoint, "https://k8s.example:6443");
        assert_eq!(cluster.ca_certificate.as_deref(), Some("Q0E="));
        assert!(!outputs.public().contains_key(TOKEN_OUTPUT));
    }

    #[test]
    fn test_endpoint_is_required() {
        let outputs = parse_outputs(r#"{"cluster_name": {"value": "prod"}}"#).unwrap();
        assert_eq!(parse(&outputs, "x").unwrap_err().stage, Stage::Parse);
    }
}
