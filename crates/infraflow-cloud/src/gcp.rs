//! GCP variable provider

use crate::error::{CloudError, Result};
use crate::provider::{StackInput, VarArg, Vars, non_empty, required, state_key, tags};
use infraflow_config::BackendSettings;
use infraflow_core::{AccessSpec, AccountOutputs, CloudType, Entity, ResourceSpec, StorageClass};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct GcpProvider {
    backend: BackendSettings,
}

impl GcpProvider {
    pub fn new(backend: BackendSettings) -> Self {
        Self { backend }
    }

    pub fn var_args(&self, input: &StackInput<'_>) -> Result<Vec<VarArg>> {
        let entity = input.entity;
        let mut vars = Vars::new();
        match &entity.spec.resource {
            ResourceSpec::Account(account) => {
                vars.set("name", &entity.metadata.name)
                    .set("region", &account.region);
            }
            ResourceSpec::Network(network) => {
                vars.set("network_name", &entity.metadata.name)
                    .set("region", &network.region)
                    .set("ip_cidr_range", &network.cidr)
                    .json("zones", &network.availability_zones)?
                    .json("public_subnet_ranges", &network.public_subnets)?
                    .json("private_subnet_ranges", &network.private_subnets)?;
            }
            ResourceSpec::Kubernetes(cluster) => {
                let (_, network) = input.network()?;
                let subnets = input.subnet_ids();
                vars.set("cluster_name", &entity.metadata.name)
                    .set("region", &network.region)
                    .set("min_master_version", &cluster.kubernetes_version)
                    .set("network", input.vpc_id()?)
                    .set("subnetwork", subnets.first().cloned().unwrap_or_default())
                    .json("node_pools", &cluster.node_pools)?;
            }
            ResourceSpec::Storage(storage) => {
                let (_, network) = input.network()?;
                match storage.class {
                    StorageClass::Bucket => {
                        vars.set("bucket_name", &entity.metadata.name)
                            .set("location", network.region.to_ascii_uppercase())
                            .set("versioning", storage.versioning.to_string());
                    }
                    StorageClass::FileSystem => {
                        vars.set("instance_name", &entity.metadata.name)
                            .set("location", &network.region)
                            .set("network", input.vpc_id()?);
                    }
                }
                if let Some(size) = storage.size_gb {
                    vars.set("capacity_gb", size.to_string());
                }
            }
        }
        vars.json("labels", &labels(entity))?;
        Ok(vars.finish())
    }

    pub fn credential_var_args(&self, access: &AccessSpec) -> Result<Vec<VarArg>> {
        let (project_id, key) = parse_access(access)?;
        Ok(vec![
            VarArg::plain("project", project_id),
            VarArg::secret("google_credentials", key),
        ])
    }

    pub fn backend_args(&self, entity: &Entity) -> Result<Vec<VarArg>> {
        let bucket = required(CloudType::Gcp, &self.backend.bucket, "bucket")?;
        Ok(vec![
            VarArg::plain("bucket", bucket),
            VarArg::plain("prefix", state_key(&self.backend, entity.kind(), &entity.id)),
        ])
    }

    /// The service account key must name a client and belong to the project
    pub fn verify_identity(&self, access: &AccessSpec) -> Result<AccountOutputs> {
        let (project_id, key) = parse_access(access)?;
        let parsed: serde_json::Value = serde_json::from_str(key)
            .map_err(|e| CloudError::Credential(format!("service account key: {}", e)))?;

        let email = parsed
            .get("client_email")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CloudError::Credential("key has no client_email".to_string()))?;
        if let Some(key_project) = parsed.get("project_id").and_then(|v| v.as_str())
            && key_project != project_id
        {
            return Err(CloudError::Credential(format!(
                "key belongs to project {}, account declares {}",
                key_project, project_id
            )));
        }

        tracing::info!("GCP credentials resolve to {}", email);
        Ok(AccountOutputs {
            account_id: project_id.to_string(),
        })
    }
}

fn parse_access(access: &AccessSpec) -> Result<(&str, &str)> {
    let AccessSpec::Gcp {
        project_id,
        service_account_key,
    } = access
    else {
        return Err(CloudError::CloudMismatch {
            expected: CloudType::Gcp,
            found: access.cloud(),
        });
    };
    non_empty(project_id, "project_id")?;
    non_empty(service_account_key.expose(), "service_account_key")?;
    Ok((project_id, service_account_key.expose()))
}

/// GCP labels only allow lowercase keys and values
fn labels(entity: &Entity) -> BTreeMap<String, String> {
    tags(entity)
        .into_iter()
        .map(|(k, v)| (sanitize_label(&k), sanitize_label(&v)))
        .collect()
}

fn sanitize_label(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(63)
        .collect()
}
