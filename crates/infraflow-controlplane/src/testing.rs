//! Entity builders and a scripted task runner for tests

use async_trait::async_trait;
use infraflow_core::{
    AccessSpec, AccountOutputs, AccountSpec, AddonSpec, CloudType, ClusterOutputs, Entity,
    EntityKind, KubernetesSpec, NetworkOutputs, NetworkSpec, NodePool, Operation, OutputValue,
    Outputs, Phase, ResourceOutputs, ResourceSpec, Secret, Spec, StorageClass, StorageOutputs,
    StorageSpec, TaskInfo, TaskResult,
};
use infraflow_deployer::TaskRunner;
use std::sync::Mutex;

pub const INFRA_VERSION: &str = "v2.3.0";

fn spec(resource: ResourceSpec) -> Spec {
    Spec {
        cloud: CloudType::Aws,
        infra_version: INFRA_VERSION.to_string(),
        resource,
    }
}

pub fn aws_access() -> AccessSpec {
    AccessSpec::Aws {
        access_key_id: "AKIATEST".to_string(),
        secret_access_key: Secret::new("secret"),
        role_arn: None,
        external_id: None,
    }
}

pub fn account(id: &str) -> Entity {
    Entity::new(
        id,
        None,
        spec(ResourceSpec::Account(AccountSpec {
            region: "us-west-2".to_string(),
            access: aws_access(),
        })),
    )
}

pub fn network(id: &str, parent: &str) -> Entity {
    network_with_cidr(id, parent, "10.0.0.0/16")
}

pub fn network_with_cidr(id: &str, parent: &str, cidr: &str) -> Entity {
    Entity::new(
        id,
        Some(parent.to_string()),
        spec(ResourceSpec::Network(NetworkSpec {
            region: "us-west-2".to_string(),
            cidr: cidr.to_string(),
            availability_zones: vec!["us-west-2a".to_string()],
            public_subnets: vec![],
            private_subnets: vec![],
        })),
    )
}

pub fn cluster(id: &str, parent: &str) -> Entity {
    Entity::new(
        id,
        Some(parent.to_string()),
        spec(ResourceSpec::Kubernetes(KubernetesSpec {
            kubernetes_version: "1.30".to_string(),
            node_pools: vec![NodePool {
                name: "default".to_string(),
                instance_type: "m5.large".to_string(),
                min_size: 1,
                max_size: 3,
                disk_size_gb: None,
            }],
            addons: AddonSpec::default(),
        })),
    )
}

pub fn storage(id: &str, parent: &str) -> Entity {
    Entity::new(
        id,
        Some(parent.to_string()),
        spec(ResourceSpec::Storage(StorageSpec {
            class: StorageClass::Bucket,
            size_gb: None,
            versioning: true,
            encryption: true,
        })),
    )
}

/// Mark an entity as applied with its current spec
pub fn activate(mut entity: Entity) -> Entity {
    entity.status.phase = Phase::Active;
    entity.status.applied_spec_hash = Some(entity.spec.hash());
    entity.status.infra_version = Some(entity.spec.infra_version.clone());
    if entity.kind() == EntityKind::Network {
        entity.status.details = Some(ResourceOutputs::Network(NetworkOutputs {
            vpc_id: "vpc-123".to_string(),
            subnet_ids: vec![],
        }));
    }
    entity
}

/// Result a healthy deployer would return for `info`
pub fn success_for(info: &TaskInfo) -> TaskResult {
    let entity = &info.entity;
    if info.operation == Operation::Destroy {
        return TaskResult::succeeded(Outputs::new(), None, entity.spec.infra_version.clone());
    }

    let mut outputs = Outputs::new();
    let details = match entity.kind() {
        EntityKind::Account => ResourceOutputs::Account(AccountOutputs {
            account_id: "123456789012".to_string(),
        }),
        EntityKind::Network => {
            outputs.insert("vpc_id".to_string(), OutputValue::String("vpc-123".to_string()));
            ResourceOutputs::Network(NetworkOutputs {
                vpc_id: "vpc-123".to_string(),
                subnet_ids: vec![],
            })
        }
        EntityKind::Kubernetes => {
            let endpoint = "https://10.0.0.10:6443".to_string();
            outputs.insert("endpoint".to_string(), OutputValue::String(endpoint.clone()));
            ResourceOutputs::Kubernetes(ClusterOutputs {
                cluster_name: entity.metadata.name.clone(),
                endpoint,
                ca_certificate: None,
                addons: vec![],
            })
        }
        EntityKind::Storage => ResourceOutputs::Storage(StorageOutputs {
            name: entity.metadata.name.clone(),
            endpoint: None,
        }),
    };
    TaskResult::succeeded(outputs, Some(details), entity.spec.infra_version.clone())
}

type Respond = dyn Fn(&TaskInfo) -> TaskResult + Send + Sync;

/// Task runner answering from a closure and recording every request
pub struct ScriptedRunner {
    respond: Box<Respond>,
    seen: Mutex<Vec<TaskInfo>>,
}

impl ScriptedRunner {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&TaskInfo) -> TaskResult + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(success_for)
    }

    pub fn seen(&self) -> Vec<TaskInfo> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run_task(&self, info: TaskInfo) -> TaskResult {
        let result = (self.respond)(&info);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(info);
        }
        result
    }
}

