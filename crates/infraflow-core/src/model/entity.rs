//! Declared cloud resources

use super::status::Status;
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Resource kind of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Account,
    Network,
    Kubernetes,
    Storage,
}

impl EntityKind {
    /// Kinds the parent of this entity may have (empty for roots)
    pub fn parent_kinds(&self) -> &'static [EntityKind] {
        match self {
            EntityKind::Account => &[],
            EntityKind::Network => &[EntityKind::Account],
            EntityKind::Kubernetes => &[EntityKind::Network],
            EntityKind::Storage => &[EntityKind::Network, EntityKind::Kubernetes],
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_kinds().is_empty()
    }

    /// Directory name used for configuration bundles and state keys
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Account => "account",
            EntityKind::Network => "network",
            EntityKind::Kubernetes => "kubernetes",
            EntityKind::Storage => "storage",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cloud an entity is provisioned on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudType {
    Aws,
    Azure,
    Gcp,
}

impl CloudType {
    pub const ALL: [CloudType; 3] = [CloudType::Aws, CloudType::Azure, CloudType::Gcp];

    pub fn as_str(&self) -> &'static str {
        match self {
            CloudType::Aws => "aws",
            CloudType::Azure => "azure",
            CloudType::Gcp => "gcp",
        }
    }
}

impl std::fmt::Display for CloudType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CloudType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(CloudType::Aws),
            "azure" => Ok(CloudType::Azure),
            "gcp" | "google" => Ok(CloudType::Gcp),
            other => Err(CoreError::InvalidSpec(format!("unknown cloud type: {}", other))),
        }
    }
}

/// Sensitive string that never shows up in `Debug` or `Display` output
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

/// What API responses show in place of a secret
const MASK: &str = "***";

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the value is the placeholder from a redacted response
    pub fn is_masked(&self) -> bool {
        self.0 == MASK
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(MASK)
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(MASK)
    }
}

/// Entity metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Human readable name
    pub name: String,

    /// Parent entity ID (`None` for accounts)
    pub parent: Option<String>,

    /// Free-form labels, forwarded to the cloud as tags
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,

    /// Set when a user asked for the entity to be destroyed
    #[serde(default)]
    pub deletion_requested_at: Option<DateTime<Utc>>,
}

/// Desired configuration of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    pub cloud: CloudType,

    /// Requested configuration bundle version (e.g. "v2.3.0")
    pub infra_version: String,

    pub resource: ResourceSpec,
}

impl Spec {
    /// Hex SHA-256 of the canonical JSON encoding.
    ///
    /// All maps in the spec are `BTreeMap`s, so the encoding is stable.
    pub fn hash(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&encoded))
    }

    pub fn kind(&self) -> EntityKind {
        self.resource.kind()
    }

    pub fn validate(&self) -> Result<()> {
        if self.infra_version.trim().is_empty() {
            return Err(CoreError::InvalidSpec("infra_version is empty".to_string()));
        }
        self.resource.validate(self.cloud)
    }
}

/// Per-kind desired configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    Account(AccountSpec),
    Network(NetworkSpec),
    Kubernetes(KubernetesSpec),
    Storage(StorageSpec),
}

impl ResourceSpec {
    pub fn kind(&self) -> EntityKind {
        match self {
            ResourceSpec::Account(_) => EntityKind::Account,
            ResourceSpec::Network(_) => EntityKind::Network,
            ResourceSpec::Kubernetes(_) => EntityKind::Kubernetes,
            ResourceSpec::Storage(_) => EntityKind::Storage,
        }
    }

    fn validate(&self, cloud: CloudType) -> Result<()> {
        match self {
            ResourceSpec::Account(account) => {
                if account.region.is_empty() {
                    return Err(CoreError::InvalidSpec("account region is empty".to_string()));
                }
                if account.access.cloud() != cloud {
                    return Err(CoreError::InvalidSpec(format!(
                        "access credentials are for {}, account is on {}",
                        account.access.cloud(),
                        cloud
                    )));
                }
                if account.access.secret().is_masked() {
                    return Err(CoreError::InvalidSpec(
                        "account secret is the redacted placeholder, not a credential".to_string(),
                    ));
                }
                Ok(())
            }
            ResourceSpec::Network(network) => {
                if network.region.is_empty() {
                    return Err(CoreError::InvalidSpec("network region is empty".to_string()));
                }
                parse_cidr(&network.cidr)?;
                for subnet in network.public_subnets.iter().chain(&network.private_subnets) {
                    parse_cidr(subnet)?;
                }
                Ok(())
            }
            ResourceSpec::Kubernetes(cluster) => {
                if cluster.kubernetes_version.is_empty() {
                    return Err(CoreError::InvalidSpec(
                        "kubernetes_version is empty".to_string(),
                    ));
                }
                if cluster.node_pools.is_empty() {
                    return Err(CoreError::InvalidSpec(
                        "cluster needs at least one node pool".to_string(),
                    ));
                }
                for pool in &cluster.node_pools {
                    if pool.min_size > pool.max_size {
                        return Err(CoreError::InvalidSpec(format!(
                            "node pool {}: min_size {} exceeds max_size {}",
                            pool.name, pool.min_size, pool.max_size
                        )));
                    }
                }
                Ok(())
            }
            ResourceSpec::Storage(storage) => {
                if storage.class == StorageClass::FileSystem && storage.size_gb.is_none() {
                    return Err(CoreError::InvalidSpec(
                        "file_system storage requires size_gb".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn parse_cidr(cidr: &str) -> Result<()> {
    let invalid = || CoreError::InvalidSpec(format!("invalid CIDR: {}", cidr));
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
    match prefix.parse::<u8>() {
        Ok(p) if p <= 32 => Ok(()),
        _ => Err(invalid()),
    }
}

/// Cloud account: the root of an entity tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSpec {
    /// Default region for API calls
    pub region: String,

    pub access: AccessSpec,
}

/// Opaque credential input for an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cloud", rename_all = "lowercase")]
pub enum AccessSpec {
    Aws {
        access_key_id: String,
        secret_access_key: Secret,
        /// Role assumed for every execution (short-lived session credentials)
        #[serde(default)]
        role_arn: Option<String>,
        #[serde(default)]
        external_id: Option<String>,
    },
    Azure {
        tenant_id: String,
        subscription_id: String,
        client_id: String,
        client_secret: Secret,
    },
    Gcp {
        project_id: String,
        service_account_key: Secret,
    },
}

impl AccessSpec {
    /// Copy with every secret replaced, for API responses
    pub fn redacted(&self) -> AccessSpec {
        let hidden = || Secret::new(MASK);
        match self.clone() {
            AccessSpec::Aws {
                access_key_id,
                role_arn,
                external_id,
                ..
            } => AccessSpec::Aws {
                access_key_id,
                secret_access_key: hidden(),
                role_arn,
                external_id,
            },
            AccessSpec::Azure {
                tenant_id,
                subscription_id,
                client_id,
                ..
            } => AccessSpec::Azure {
                tenant_id,
                subscription_id,
                client_id,
                client_secret: hidden(),
            },
            AccessSpec::Gcp { project_id, .. } => AccessSpec::Gcp {
                project_id,
                service_account_key: hidden(),
            },
        }
    }

    pub fn secret(&self) -> &Secret {
        match self {
            AccessSpec::Aws {
                secret_access_key, ..
            } => secret_access_key,
            AccessSpec::Azure { client_secret, .. } => client_secret,
            AccessSpec::Gcp {
                service_account_key,
                ..
            } => service_account_key,
        }
    }

    pub fn cloud(&self) -> CloudType {
        match self {
            AccessSpec::Aws { .. } => CloudType::Aws,
            AccessSpec::Azure { .. } => CloudType::Azure,
            AccessSpec::Gcp { .. } => CloudType::Gcp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub region: String,

    /// Address range of the virtual network (e.g. "10.0.0.0/16")
    pub cidr: String,

    #[serde(default)]
    pub availability_zones: Vec<String>,

    #[serde(default)]
    pub public_subnets: Vec<String>,

    #[serde(default)]
    pub private_subnets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubernetesSpec {
    pub kubernetes_version: String,

    pub node_pools: Vec<NodePool>,

    #[serde(default)]
    pub addons: AddonSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,
    pub instance_type: String,
    pub min_size: u32,
    pub max_size: u32,
    #[serde(default)]
    pub disk_size_gb: Option<u32>,
}

/// Post-provisioning add-ons installed on a fresh cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonSpec {
    pub storage_classes: bool,
    pub ingress: bool,
    pub autoscaler: bool,
}

impl Default for AddonSpec {
    fn default() -> Self {
        Self {
            storage_classes: true,
            ingress: false,
            autoscaler: false,
        }
    }
}

impl AddonSpec {
    /// Enabled add-on names, in installation order
    pub fn enabled(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.storage_classes {
            names.push("storage-classes");
        }
        if self.ingress {
            names.push("ingress");
        }
        if self.autoscaler {
            names.push("autoscaler");
        }
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    Bucket,
    FileSystem,
}

impl std::fmt::Display for StorageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageClass::Bucket => write!(f, "bucket"),
            StorageClass::FileSystem => write!(f, "file_system"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSpec {
    pub class: StorageClass,

    #[serde(default)]
    pub size_gb: Option<u32>,

    #[serde(default)]
    pub versioning: bool,

    #[serde(default = "default_true")]
    pub encryption: bool,
}

fn default_true() -> bool {
    true
}

/// A declared cloud resource with its desired and observed state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier, also used as the state-backend key
    pub id: String,

    pub metadata: Metadata,

    pub spec: Spec,

    #[serde(default)]
    pub status: Status,
}

impl Entity {
    pub fn new(id: impl Into<String>, parent: Option<String>, spec: Spec) -> Self {
        let id = id.into();
        Self {
            metadata: Metadata {
                name: id.clone(),
                parent,
                labels: BTreeMap::new(),
                created_at: Utc::now(),
                deletion_requested_at: None,
            },
            id,
            spec,
            status: Status::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.metadata.name = name.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> EntityKind {
        self.spec.kind()
    }

    pub fn parent(&self) -> Option<&str> {
        self.metadata.parent.as_deref()
    }

    pub fn is_deletion_requested(&self) -> bool {
        self.metadata.deletion_requested_at.is_some()
    }

    /// Copy safe to hand to API clients
    pub fn redacted(&self) -> Entity {
        let mut entity = self.clone();
        if let ResourceSpec::Account(account) = &mut entity.spec.resource {
            account.access = account.access.redacted();
        }
        entity
    }

    /// Whether the desired spec differs from the last successfully applied one
    pub fn has_drift(&self) -> bool {
        self.status.applied_spec_hash.as_deref() != Some(self.spec.hash().as_str())
    }
}
