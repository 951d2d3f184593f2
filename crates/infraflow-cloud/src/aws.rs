//! AWS variable provider

use crate::error::{CloudError, Result};
use crate::provider::{StackInput, VarArg, Vars, non_empty, required, state_key, tags};
use crate::sts::{AwsCli, AwsCredentials};
use infraflow_config::{BackendSettings, CredentialConfig};
use infraflow_core::{AccessSpec, AccountOutputs, CloudType, Entity, ResourceSpec};

/// Region used for STS calls when the backend does not name one
const DEFAULT_STS_REGION: &str = "us-east-1";

#[derive(Debug, Clone)]
pub struct AwsProvider {
    backend: BackendSettings,
    cli: AwsCli,
}

impl AwsProvider {
    pub fn new(backend: BackendSettings, credentials: &CredentialConfig) -> Self {
        Self {
            backend,
            cli: AwsCli::new(&credentials.aws_cli, credentials.session_duration),
        }
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
                vars.set("name", &entity.metadata.name)
                    .set("region", &network.region)
                    .set("vpc_cidr", &network.cidr)
                    .json("availability_zones", &network.availability_zones)?
                    .json("public_subnet_cidrs", &network.public_subnets)?
                    .json("private_subnet_cidrs", &network.private_subnets)?;
            }
            ResourceSpec::Kubernetes(cluster) => {
                let (_, network) = input.network()?;
                vars.set("cluster_name", &entity.metadata.name)
                    .set("region", &network.region)
                    .set("kubernetes_version", &cluster.kubernetes_version)
                    .set("vpc_id", input.vpc_id()?)
                    .json("subnet_ids", &input.subnet_ids())?
                    .json("node_groups", &cluster.node_pools)?;
            }
            ResourceSpec::Storage(storage) => {
                let (_, network) = input.network()?;
                vars.set("name", &entity.metadata.name)
                    .set("region", &network.region)
                    .set("storage_class", storage.class.to_string())
                    .set("versioning", storage.versioning.to_string())
                    .set("encryption", storage.encryption.to_string())
                    .set("vpc_id", input.vpc_id()?);
                if let Some(size) = storage.size_gb {
                    vars.set("size_gb", size.to_string());
                }
            }
        }
        vars.json("tags", &tags(entity))?;
        Ok(vars.finish())
    }

    pub async fn credential_var_args(
        &self,
        access: &AccessSpec,
        entity_id: &str,
    ) -> Result<Vec<VarArg>> {
        let credentials = self.resolve(access, entity_id).await?;
        let mut args = vec![
            VarArg::secret("aws_access_key_id", credentials.access_key_id),
            VarArg::secret(
                "aws_secret_access_key",
                credentials.secret_access_key.expose(),
            ),
        ];
        if let Some(token) = credentials.session_token {
            args.push(VarArg::secret("aws_session_token", token.expose()));
        }
        Ok(args)
    }

    pub fn backend_args(&self, entity: &Entity) -> Result<Vec<VarArg>> {
        let bucket = required(CloudType::Aws, &self.backend.bucket, "bucket")?;
        let region = required(CloudType::Aws, &self.backend.region, "region")?;
        let key = format!(
            "{}/terraform.tfstate",
            state_key(&self.backend, entity.kind(), &entity.id)
        );

        let mut args = vec![
            VarArg::plain("bucket", bucket),
            VarArg::plain("key", key),
            VarArg::plain("region", region),
            VarArg::plain("encrypt", "true"),
        ];
        if let Some(table) = self.backend.lock_table.as_deref().filter(|t| !t.is_empty()) {
            args.push(VarArg::plain("dynamodb_table", table));
        }
        Ok(args)
    }

    pub async fn verify_identity(
        &self,
        access: &AccessSpec,
        entity_id: &str,
    ) -> Result<AccountOutputs> {
        let credentials = self.resolve(access, entity_id).await?;
        let identity = self
            .cli
            .caller_identity(&credentials, self.sts_region())
            .await?;
        tracing::info!("{}: credentials resolve to {}", entity_id, identity.arn);
        Ok(AccountOutputs {
            account_id: identity.account,
        })
    }

    /// Base keys, exchanged for role session credentials when a role is set
    async fn resolve(&self, access: &AccessSpec, entity_id: &str) -> Result<AwsCredentials> {
        let AccessSpec::Aws {
            access_key_id,
            secret_access_key,
            role_arn,
            external_id,
        } = access
        else {
            return Err(CloudError::CloudMismatch {
                expected: CloudType::Aws,
                found: access.cloud(),
            });
        };
        non_empty(access_key_id, "access_key_id")?;
        non_empty(secret_access_key.expose(), "secret_access_key")?;

        let base = AwsCredentials::from_keys(access_key_id, secret_access_key.clone());
        match role_arn.as_deref().filter(|r| !r.is_empty()) {
            Some(role_arn) => {
                self.cli
                    .assume_role(
                        &base,
                        self.sts_region(),
                        role_arn,
                        external_id.as_deref(),
                        &session_name(entity_id),
                    )
                    .await
            }
            None => Ok(base),
        }
    }

    fn sts_region(&self) -> &str {
        self.backend.region.as_deref().unwrap_or(DEFAULT_STS_REGION)
    }
}

/// STS session names allow `[\w+=,.@-]{2,64}`
fn session_name(entity_id: &str) -> String {
    let cleaned: String = format!("infraflow-{}", entity_id)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "+=,.@-_".contains(c) {
                c
            } else {
                '-'
            }
        })
        .take(64)
        .collect();
    cleaned
}
