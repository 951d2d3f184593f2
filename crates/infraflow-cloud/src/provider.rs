//! Cloud-agnostic provider surface
//!
//! [`VariableProvider`] is a closed enum over the supported clouds. Every
//! variant answers the same four questions for an entity: which variables
//! describe it, which credentials the tool needs, where its remote state
//! lives and which account the credentials belong to.

use crate::aws::AwsProvider;
use crate::azure::AzureProvider;
use crate::error::{CloudError, Result};
use crate::gcp::GcpProvider;
use infraflow_config::{BackendSettings, CredentialConfig, DaemonConfig};
use infraflow_core::{
    AccessSpec, AccountOutputs, CloudType, Entity, EntityKind, NetworkSpec, ResourceSpec,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// One `key=value` argument for the IaC tool
#[derive(Clone, PartialEq, Eq)]
pub struct VarArg {
    pub key: String,
    pub value: String,
    /// Sensitive values are passed through the environment, never argv
    pub sensitive: bool,
}

impl VarArg {
    pub fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            sensitive: false,
        }
    }

    pub fn secret(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            sensitive: true,
        }
    }
}

impl std::fmt::Debug for VarArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::fmt::Display for VarArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sensitive {
            write!(f, "{}=***", self.key)
        } else {
            write!(f, "{}={}", self.key, self.value)
        }
    }
}

/// Everything `var_args` may look at
#[derive(Debug, Clone, Copy)]
pub struct StackInput<'a> {
    pub entity: &'a Entity,
    /// Parent first, root account last
    pub ancestors: &'a [Entity],
}

impl<'a> StackInput<'a> {
    pub fn new(entity: &'a Entity, ancestors: &'a [Entity]) -> Self {
        Self { entity, ancestors }
    }

    /// Nearest network above a cluster or storage entity
    pub(crate) fn network(&self) -> Result<(&'a Entity, &'a NetworkSpec)> {
        self.ancestors
            .iter()
            .find_map(|ancestor| match &ancestor.spec.resource {
                ResourceSpec::Network(network) => Some((ancestor, network)),
                _ => None,
            })
            .ok_or_else(|| {
                CloudError::MissingInput(format!("{} has no network ancestor", self.entity.id))
            })
    }

    /// VPC / VNet id recorded on the network
    pub(crate) fn vpc_id(&self) -> Result<&'a str> {
        let (network, _) = self.network()?;
        network.status.vpc_id().ok_or_else(|| {
            CloudError::MissingInput(format!("network {} has no vpc_id output", network.id))
        })
    }

    pub(crate) fn subnet_ids(&self) -> Vec<String> {
        match self.network().map(|(n, _)| &n.status.details) {
            Ok(Some(infraflow_core::ResourceOutputs::Network(network))) => {
                network.subnet_ids.clone()
            }
            _ => Vec::new(),
        }
    }
}

/// Ordered argument list builder
#[derive(Default)]
pub(crate) struct Vars(Vec<VarArg>);

impl Vars {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.0.push(VarArg::plain(key, value));
        self
    }

    pub(crate) fn json<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<&mut Self> {
        self.0.push(VarArg::plain(key, serde_json::to_string(value)?));
        Ok(self)
    }

    pub(crate) fn finish(self) -> Vec<VarArg> {
        self.0
    }
}

/// Labels plus the ownership tags every resource carries
pub(crate) fn tags(entity: &Entity) -> BTreeMap<String, String> {
    let mut tags = entity.metadata.labels.clone();
    tags.insert("infraflow-entity".to_string(), entity.id.clone());
    tags.insert("managed-by".to_string(), "infraflow".to_string());
    tags
}

/// Stable per-entity state location, `<prefix>/<kind>/<entity-id>`
pub(crate) fn state_key(settings: &BackendSettings, kind: EntityKind, entity_id: &str) -> String {
    let prefix = settings
        .key_prefix
        .as_deref()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .unwrap_or("infraflow");
    format!("{}/{}/{}", prefix, kind, entity_id)
}

pub(crate) fn required<'a>(
    cloud: CloudType,
    value: &'a Option<String>,
    name: &str,
) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CloudError::BackendNotConfigured(cloud, format!("{} is not set", name)))
}

pub(crate) fn non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CloudError::Credential(format!("{} is empty", name)));
    }
    Ok(())
}

/// Per-cloud variable provider
#[derive(Debug, Clone)]
pub enum VariableProvider {
    Aws(AwsProvider),
    Azure(AzureProvider),
    Gcp(GcpProvider),
}

impl VariableProvider {
    pub fn for_cloud(
        cloud: CloudType,
        backend: BackendSettings,
        credentials: &CredentialConfig,
    ) -> Self {
        match cloud {
            CloudType::Aws => VariableProvider::Aws(AwsProvider::new(backend, credentials)),
            CloudType::Azure => VariableProvider::Azure(AzureProvider::new(backend)),
            CloudType::Gcp => VariableProvider::Gcp(GcpProvider::new(backend)),
        }
    }

    pub fn cloud(&self) -> CloudType {
        match self {
            VariableProvider::Aws(_) => CloudType::Aws,
            VariableProvider::Azure(_) => CloudType::Azure,
            VariableProvider::Gcp(_) => CloudType::Gcp,
        }
    }

    /// Variables describing the entity. Same input, same list.
    pub fn var_args(&self, input: &StackInput<'_>) -> Result<Vec<VarArg>> {
        match self {
            VariableProvider::Aws(p) => p.var_args(input),
            VariableProvider::Azure(p) => p.var_args(input),
            VariableProvider::Gcp(p) => p.var_args(input),
        }
    }

    /// Credential variables, resolved fresh on every call
    pub async fn credential_var_args(
        &self,
        access: &AccessSpec,
        entity_id: &str,
    ) -> Result<Vec<VarArg>> {
        self.check_cloud(access)?;
        match self {
            VariableProvider::Aws(p) => p.credential_var_args(access, entity_id).await,
            VariableProvider::Azure(p) => p.credential_var_args(access),
            VariableProvider::Gcp(p) => p.credential_var_args(access),
        }
    }

    /// Remote state settings unique to the entity
    pub fn backend_args(&self, entity: &Entity) -> Result<Vec<VarArg>> {
        match self {
            VariableProvider::Aws(p) => p.backend_args(entity),
            VariableProvider::Azure(p) => p.backend_args(entity),
            VariableProvider::Gcp(p) => p.backend_args(entity),
        }
    }

    /// Check the credentials and report the account they belong to
    pub async fn verify_identity(
        &self,
        access: &AccessSpec,
        entity_id: &str,
    ) -> Result<AccountOutputs> {
        self.check_cloud(access)?;
        match self {
            VariableProvider::Aws(p) => p.verify_identity(access, entity_id).await,
            VariableProvider::Azure(p) => p.verify_identity(access),
            VariableProvider::Gcp(p) => p.verify_identity(access),
        }
    }

    fn check_cloud(&self, access: &AccessSpec) -> Result<()> {
        if access.cloud() != self.cloud() {
            return Err(CloudError::CloudMismatch {
                expected: self.cloud(),
                found: access.cloud(),
            });
        }
        Ok(())
    }
}

/// One provider per cloud, built once from the daemon config
#[derive(Debug, Clone)]
pub struct ProviderTable {
    aws: VariableProvider,
    azure: VariableProvider,
    gcp: VariableProvider,
}

impl ProviderTable {
    pub fn from_config(config: &DaemonConfig) -> Self {
        let build = |cloud| {
            VariableProvider::for_cloud(cloud, config.backend(cloud), &config.credentials)
        };
        Self {
            aws: build(CloudType::Aws),
            azure: build(CloudType::Azure),
            gcp: build(CloudType::Gcp),
        }
    }

    pub fn get(&self, cloud: CloudType) -> &VariableProvider {
        match cloud {
            CloudType::Aws => &self.aws,
            CloudType::Azure => &self.azure,
            CloudType::Gcp => &self.gcp,
        }
    }
}
