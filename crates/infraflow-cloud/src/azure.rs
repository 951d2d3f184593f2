//! Azure variable provider

use crate::error::{CloudError, Result};
use crate::provider::{StackInput, VarArg, Vars, non_empty, required, state_key, tags};
use infraflow_config::BackendSettings;
use infraflow_core::{
    AccessSpec, AccountOutputs, CloudType, Entity, ResourceSpec, StorageClass,
};

#[derive(Debug, Clone)]
pub struct AzureProvider {
    backend: BackendSettings,
}

impl AzureProvider {
    pub fn new(backend: BackendSettings) -> Self {
        Self { backend }
    }

    pub fn var_args(&self, input: &StackInput<'_>) -> Result<Vec<VarArg>> {
        let entity = input.entity;
        let mut vars = Vars::new();
        match &entity.spec.resource {
            ResourceSpec::Account(account) => {
                vars.set("name", &entity.metadata.name)
                    .set("location", &account.region);
            }
            ResourceSpec::Network(network) => {
                vars.set("name", &entity.metadata.name)
                    .set("location", &network.region)
                    .set("resource_group_name", resource_group(&entity.id))
                    .json("address_space", &[&network.cidr])?
                    .json("zones", &network.availability_zones)?
                    .json("public_subnet_prefixes", &network.public_subnets)?
                    .json("private_subnet_prefixes", &network.private_subnets)?;
            }
            ResourceSpec::Kubernetes(cluster) => {
                let (parent, network) = input.network()?;
                vars.set("cluster_name", &entity.metadata.name)
                    .set("location", &network.region)
                    .set("resource_group_name", resource_group(&parent.id))
                    .set("kubernetes_version", &cluster.kubernetes_version)
                    .set("vnet_id", input.vpc_id()?)
                    .json("subnet_ids", &input.subnet_ids())?
                    .json("node_pools", &cluster.node_pools)?;
            }
            ResourceSpec::Storage(storage) => {
                let (parent, network) = input.network()?;
                let kind = match storage.class {
                    StorageClass::Bucket => "blob",
                    StorageClass::FileSystem => "files",
                };
                vars.set("storage_account_name", storage_account_name(&entity.id))
                    .set("location", &network.region)
                    .set("resource_group_name", resource_group(&parent.id))
                    .set("storage_kind", kind)
                    .set("versioning", storage.versioning.to_string())
                    .set("vnet_id", input.vpc_id()?);
                if let Some(size) = storage.size_gb {
                    vars.set("quota_gb", size.to_string());
                }
            }
        }
        vars.json("tags", &tags(entity))?;
        Ok(vars.finish())
    }

    pub fn credential_var_args(&self, access: &AccessSpec) -> Result<Vec<VarArg>> {
        let AccessSpec::Azure {
            tenant_id,
            subscription_id,
            client_id,
            client_secret,
        } = access
        else {
            return Err(CloudError::CloudMismatch {
                expected: CloudType::Azure,
                found: access.cloud(),
            });
        };
        non_empty(tenant_id, "tenant_id")?;
        non_empty(subscription_id, "subscription_id")?;
        non_empty(client_id, "client_id")?;
        non_empty(client_secret.expose(), "client_secret")?;

        Ok(vec![
            VarArg::secret("arm_tenant_id", tenant_id),
            VarArg::secret("arm_subscription_id", subscription_id),
            VarArg::secret("arm_client_id", client_id),
            VarArg::secret("arm_client_secret", client_secret.expose()),
        ])
    }

    pub fn backend_args(&self, entity: &Entity) -> Result<Vec<VarArg>> {
        let cloud = CloudType::Azure;
        Ok(vec![
            VarArg::plain(
                "resource_group_name",
                required(cloud, &self.backend.resource_group, "resource-group")?,
            ),
            VarArg::plain(
                "storage_account_name",
                required(cloud, &self.backend.storage_account, "storage-account")?,
            ),
            VarArg::plain(
                "container_name",
                required(cloud, &self.backend.container, "container")?,
            ),
            VarArg::plain(
                "key",
                format!(
                    "{}.tfstate",
                    state_key(&self.backend, entity.kind(), &entity.id)
                ),
            ),
        ])
    }

    /// Azure identities are the subscription the service principal targets
    pub fn verify_identity(&self, access: &AccessSpec) -> Result<AccountOutputs> {
        self.credential_var_args(access)?;
        match access {
            AccessSpec::Azure {
                subscription_id, ..
            } => Ok(AccountOutputs {
                account_id: subscription_id.clone(),
            }),
            other => Err(CloudError::CloudMismatch {
                expected: CloudType::Azure,
                found: other.cloud(),
            }),
        }
    }
}

fn resource_group(network_id: &str) -> String {
    format!("rg-{}", network_id)
}

/// Storage account names are 3-24 lowercase alphanumerics
fn storage_account_name(entity_id: &str) -> String {
    let mut name: String = entity_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(24)
        .collect();
    while name.len() < 3 {
        name.push('0');
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use infraflow_core::{NetworkOutputs, NetworkSpec, ResourceOutputs, Secret, Spec, StorageSpec};

    fn network() -> Entity {
        let mut entity = Entity::new(
            "vnet-1",
            Some("sub-1".to_string()),
            Spec {
                cloud: CloudType::Azure,
                infra_version: "v1.4.0".to_string(),
                resource: ResourceSpec::Network(NetworkSpec {
                    region: "westeurope".to_string(),
                    cidr: "10.10.0.0/16".to_string(),
                    availability_zones: vec![],
                    public_subnets: vec![],
                    private_subnets: vec![],
                }),
            },
        );
        entity.status.details = Some(ResourceOutputs::Network(NetworkOutputs {
            vpc_id: "/subscriptions/x/vnet-1".to_string(),
            subnet_ids: vec![],
        }));
        entity
    }

    #[test]
    fn test_storage_var_args() {
        let parent = network();
        let storage = Entity::new(
            "Data-Lake_01",
            Some("vnet-1".to_string()),
            Spec {
                cloud: CloudType::Azure,
                infra_version: "v1.4.0".to_string(),
                resource: ResourceSpec::Storage(StorageSpec {
                    class: StorageClass::FileSystem,
                    size_gb: Some(100),
                    versioning: false,
                    encryption: true,
                }),
            },
        );
        let args = AzureProvider::new(BackendSettings::default())
            .var_args(&StackInput::new(&storage, std::slice::from_ref(&parent)))
            .unwrap();
        let get = |k: &str| args.iter().find(|a| a.key == k).map(|a| a.value.clone());

        assert_eq!(get("storage_account_name").as_deref(), Some("datalake01"));
        assert_eq!(get("resource_group_name").as_deref(), Some("rg-vnet-1"));
        assert_eq!(get("storage_kind").as_deref(), Some("files"));
        assert_eq!(get("quota_gb").as_deref(), Some("100"));
    }

    #[test]
    fn test_backend_requires_all_settings() {
        let partial = AzureProvider::new(BackendSettings {
            resource_group: Some("tfstate".to_string()),
            ..Default::default()
        });
        assert!(partial.backend_args(&network()).is_err());

        let full = AzureProvider::new(BackendSettings {
            resource_group: Some("tfstate".to_string()),
            storage_account: Some("tfstateacct".to_string()),
            container: Some("states".to_string()),
            ..Default::default()
        });
        let args = full.backend_args(&network()).unwrap();
        assert_eq!(args[3].value, "infraflow/network/vnet-1.tfstate");
    }

    #[test]
    fn test_identity_is_subscription() {
        let access = AccessSpec::Azure {
            tenant_id: "t".to_string(),
            subscription_id: "sub-123".to_string(),
            client_id: "c".to_string(),
            client_secret: Secret::new("s"),
        };
        let identity = AzureProvider::new(BackendSettings::default())
            .verify_identity(&access)
            .unwrap();
        assert_eq!(identity.account_id, "sub-123");
    }

    #[test]
    fn test_storage_account_name_padding() {
        assert_eq!(storage_account_name("a-"), "a00");
        assert_eq!(storage_account_name(&"b".repeat(40)).len(), 24);
    }
}
