//! KDL entity manifests
//!
//! Declares entities in a file the daemon can load at startup:
//!
//! ```kdl
//! account "prod" cloud="aws" version="v2.3.0" {
//!     region "us-west-2"
//!     access {
//!         access-key-id "AKIA..."
//!         secret-access-key "..."
//!         role-arn "arn:aws:iam::123456789012:role/infraflow"
//!     }
//! }
//!
//! network "prod-net" parent="prod" {
//!     region "us-west-2"
//!     cidr "10.0.0.0/16"
//!     zones "us-west-2a" "us-west-2b"
//! }
//!
//! kubernetes "prod-eks" parent="prod-net" {
//!     kubernetes-version "1.29"
//!     node-pool "default" instance-type="m5.large" min=1 max=3
//!     addons storage-classes=#true ingress=#true autoscaler=#false
//! }
//!
//! storage "prod-data" parent="prod-net" {
//!     class "bucket"
//!     versioning #true
//! }
//! ```
//!
//! Children without `cloud=` / `version=` inherit them from their parent
//! when the parent is declared in the same manifest.

use crate::error::{CoreError, Result};
use crate::model::{
    AccessSpec, AccountSpec, AddonSpec, CloudType, Entity, EntityKind, KubernetesSpec,
    NetworkSpec, NodePool, ResourceSpec, Secret, Spec, StorageClass, StorageSpec,
};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

/// One entity declaration, from a manifest or an API create request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDecl {
    pub id: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub spec: Spec,
}

impl EntityDecl {
    pub fn into_entity(self) -> Entity {
        let mut entity = Entity::new(self.id, self.parent, self.spec);
        entity.metadata.labels = self.labels;
        entity
    }
}

pub fn parse_manifest_file<P: AsRef<Path>>(path: P) -> Result<Vec<EntityDecl>> {
    let content = fs::read_to_string(path.as_ref())?;
    parse_manifest_str(&content)
}

pub fn parse_manifest_str(content: &str) -> Result<Vec<EntityDecl>> {
    let doc: KdlDocument = content.parse()?;

    let mut decls: Vec<EntityDecl> = Vec::new();
    let mut placement: HashMap<String, (CloudType, String)> = HashMap::new();

    for node in doc.nodes() {
        let kind = match node.name().value() {
            "account" => EntityKind::Account,
            "network" => EntityKind::Network,
            "kubernetes" | "cluster" => EntityKind::Kubernetes,
            "storage" => EntityKind::Storage,
            other => {
                tracing::debug!("Skipping unknown manifest node: {}", other);
                continue;
            }
        };

        let id = first_string(node)
            .ok_or_else(|| CoreError::Manifest(format!("{} requires a name", kind)))?;
        if placement.contains_key(&id) {
            return Err(CoreError::Manifest(format!("duplicate entity: {}", id)));
        }

        let parent = property_string(node, "parent");
        if !kind.is_root() && parent.is_none() {
            return Err(CoreError::Manifest(format!("{} {} requires parent=", kind, id)));
        }

        let inherited = parent.as_ref().and_then(|p| placement.get(p)).cloned();
        let cloud = match property_string(node, "cloud") {
            Some(value) => value.parse::<CloudType>()?,
            None => inherited
                .as_ref()
                .map(|(cloud, _)| *cloud)
                .ok_or_else(|| CoreError::Manifest(format!("{} requires cloud=", id)))?,
        };
        let infra_version = match property_string(node, "version") {
            Some(value) => value,
            None => inherited
                .map(|(_, version)| version)
                .ok_or_else(|| CoreError::Manifest(format!("{} requires version=", id)))?,
        };

        let resource = match kind {
            EntityKind::Account => ResourceSpec::Account(parse_account(node, &id, cloud)?),
            EntityKind::Network => ResourceSpec::Network(parse_network(node, &id)?),
            EntityKind::Kubernetes => ResourceSpec::Kubernetes(parse_kubernetes(node, &id)?),
            EntityKind::Storage => ResourceSpec::Storage(parse_storage(node, &id)?),
        };

        let spec = Spec {
            cloud,
            infra_version: infra_version.clone(),
            resource,
        };
        spec.validate()?;

        placement.insert(id.clone(), (cloud, infra_version));
        decls.push(EntityDecl {
            id,
            parent,
            labels: parse_labels(node),
            spec,
        });
    }

    Ok(decls)
}

fn first_string(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn positional_strings(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn property_string(node: &KdlNode, key: &str) -> Option<String> {
    node.get(key)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn property_u32(node: &KdlNode, key: &str) -> Option<u32> {
    node.get(key)
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok())
}

fn property_bool(node: &KdlNode, key: &str) -> Option<bool> {
    node.get(key).and_then(|v| v.as_bool())
}

fn child_nodes(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn child_string(node: &KdlNode, name: &str) -> Option<String> {
    child_nodes(node)
        .find(|c| c.name().value() == name)
        .and_then(first_string)
}

fn child_bool(node: &KdlNode, name: &str) -> Option<bool> {
    child_nodes(node)
        .find(|c| c.name().value() == name)
        .and_then(|c| c.entries().first())
        .and_then(|e| e.value().as_bool())
}

fn child_u32(node: &KdlNode, name: &str) -> Option<u32> {
    child_nodes(node)
        .find(|c| c.name().value() == name)
        .and_then(|c| c.entries().first())
        .and_then(|e| e.value().as_integer())
        .and_then(|v| u32::try_from(v).ok())
}

fn require_child(node: &KdlNode, id: &str, name: &str) -> Result<String> {
    child_string(node, name)
        .ok_or_else(|| CoreError::Manifest(format!("{}: missing {}", id, name)))
}

fn parse_labels(node: &KdlNode) -> BTreeMap<String, String> {
    child_nodes(node)
        .filter(|c| c.name().value() == "label")
        .filter_map(|c| {
            let values = positional_strings(c);
            match values.as_slice() {
                [key, value] => Some((key.clone(), value.clone())),
                _ => None,
            }
        })
        .collect()
}

fn parse_account(node: &KdlNode, id: &str, cloud: CloudType) -> Result<AccountSpec> {
    let region = require_child(node, id, "region")?;
    let access_node = child_nodes(node)
        .find(|c| c.name().value() == "access")
        .ok_or_else(|| CoreError::Manifest(format!("{}: missing access block", id)))?;
    let field = |name: &str| require_child(access_node, id, name);

    let access = match cloud {
        CloudType::Aws => AccessSpec::Aws {
            access_key_id: field("access-key-id")?,
            secret_access_key: Secret::new(field("secret-access-key")?),
            role_arn: child_string(access_node, "role-arn"),
            external_id: child_string(access_node, "external-id"),
        },
        CloudType::Azure => AccessSpec::Azure {
            tenant_id: field("tenant-id")?,
            subscription_id: field("subscription-id")?,
            client_id: field("client-id")?,
            client_secret: Secret::new(field("client-secret")?),
        },
        CloudType::Gcp => AccessSpec::Gcp {
            project_id: field("project-id")?,
            service_account_key: Secret::new(field("service-account-key")?),
        },
    };

    Ok(AccountSpec { region, access })
}

fn parse_network(node: &KdlNode, id: &str) -> Result<NetworkSpec> {
    let list = |name: &str| {
        child_nodes(node)
            .find(|c| c.name().value() == name)
            .map(positional_strings)
            .unwrap_or_default()
    };

    Ok(NetworkSpec {
        region: require_child(node, id, "region")?,
        cidr: require_child(node, id, "cidr")?,
        availability_zones: list("zones"),
        public_subnets: list("public-subnets"),
        private_subnets: list("private-subnets"),
    })
}

fn parse_kubernetes(node: &KdlNode, id: &str) -> Result<KubernetesSpec> {
    let mut node_pools = Vec::new();
    for pool in child_nodes(node).filter(|c| c.name().value() == "node-pool") {
        let name = first_string(pool)
            .ok_or_else(|| CoreError::Manifest(format!("{}: node-pool requires a name", id)))?;
        let instance_type = property_string(pool, "instance-type").ok_or_else(|| {
            CoreError::Manifest(format!("{}: node-pool {} requires instance-type=", id, name))
        })?;
        let min_size = property_u32(pool, "min").unwrap_or(1);
        node_pools.push(NodePool {
            name,
            instance_type,
            min_size,
            max_size: property_u32(pool, "max").unwrap_or(min_size),
            disk_size_gb: property_u32(pool, "disk-size"),
        });
    }

    let mut addons = AddonSpec::default();
    if let Some(addon_node) = child_nodes(node).find(|c| c.name().value() == "addons") {
        if let Some(v) = property_bool(addon_node, "storage-classes") {
            addons.storage_classes = v;
        }
        if let Some(v) = property_bool(addon_node, "ingress") {
            addons.ingress = v;
        }
        if let Some(v) = property_bool(addon_node, "autoscaler") {
            addons.autoscaler = v;
        }
    }

    Ok(KubernetesSpec {
        kubernetes_version: require_child(node, id, "kubernetes-version")?,
        node_pools,
        addons,
    })
}

fn parse_storage(node: &KdlNode, id: &str) -> Result<StorageSpec> {
    let class = match child_string(node, "class").as_deref() {
        None | Some("bucket") => StorageClass::Bucket,
        Some("file-system") | Some("file_system") => StorageClass::FileSystem,
        Some(other) => {
            return Err(CoreError::Manifest(format!(
                "{}: unknown storage class {}",
                id, other
            )));
        }
    };

    Ok(StorageSpec {
        class,
        size_gb: child_u32(node, "size-gb"),
        versioning: child_bool(node, "versioning").unwrap_or(false),
        encryption: child_bool(node, "encryption").unwrap_or(true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
account "prod" cloud="aws" version="v2.3.0" {
    region "us-west-2"
    access {
        access-key-id "AKIAEXAMPLE"
        secret-access-key "secret"
        role-arn "arn:aws:iam::123456789012:role/infraflow"
    }
    label "team" "platform"
}

network "prod-net" parent="prod" {
    region "us-west-2"
    cidr "10.0.0.0/16"
    zones "us-west-2a" "us-west-2b"
    private-subnets "10.0.10.0/24" "10.0.11.0/24"
}

kubernetes "prod-eks" parent="prod-net" {
    kubernetes-version "1.29"
    node-pool "default" instance-type="m5.large" min=1 max=3
    addons storage-classes=#true ingress=#true autoscaler=#false
}

storage "prod-data" parent="prod-net" version="v2.4.0" {
    class "bucket"
    versioning #true
}
"#;

    #[test]
    fn test_parse_full_manifest() {
        let decls = parse_manifest_str(MANIFEST).unwrap();
        assert_eq!(decls.len(), 4);

        let account = &decls[0];
        assert_eq!(account.id, "prod");
        assert_eq!(account.labels.get("team"), Some(&"platform".to_string()));
        match &account.spec.resource {
            ResourceSpec::Account(spec) => match &spec.access {
                AccessSpec::Aws { role_arn, .. } => assert!(role_arn.is_some()),
                other => panic!("unexpected access: {:?}", other),
            },
            other => panic!("unexpected resource: {:?}", other),
        }

        let network = &decls[1];
        assert_eq!(network.parent.as_deref(), Some("prod"));
        assert_eq!(network.spec.cloud, CloudType::Aws);
        assert_eq!(network.spec.infra_version, "v2.3.0");
        match &network.spec.resource {
            ResourceSpec::Network(spec) => {
                assert_eq!(spec.cidr, "10.0.0.0/16");
                assert_eq!(spec.availability_zones.len(), 2);
                assert_eq!(spec.private_subnets.len(), 2);
            }
            other => panic!("unexpected resource: {:?}", other),
        }

        match &decls[2].spec.resource {
            ResourceSpec::Kubernetes(spec) => {
                assert_eq!(spec.node_pools[0].max_size, 3);
                assert_eq!(spec.addons.enabled(), vec!["storage-classes", "ingress"]);
            }
            other => panic!("unexpected resource: {:?}", other),
        }

        let storage = &decls[3];
        assert_eq!(storage.spec.infra_version, "v2.4.0");
        assert!(matches!(
            &storage.spec.resource,
            ResourceSpec::Storage(StorageSpec { versioning: true, .. })
        ));
    }

    #[test]
    fn test_child_requires_parent() {
        let err = parse_manifest_str(
            r#"network "orphan" cloud="aws" version="v1" { region "x"; cidr "10.0.0.0/16" }"#,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Manifest(_)));
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let content = format!("{}\n{}", MANIFEST, r#"storage "prod-data" parent="prod-net" { }"#);
        assert!(parse_manifest_str(&content).is_err());
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let content = MANIFEST.replace("10.0.0.0/16", "10.0.0.0/99");
        assert!(matches!(
            parse_manifest_str(&content),
            Err(CoreError::InvalidSpec(_))
        ));
    }
}
