//! Entity, status and task model

mod entity;
mod status;
mod task;

pub use entity::{
    AccessSpec, AccountSpec, AddonSpec, CloudType, Entity, EntityKind, KubernetesSpec, Metadata,
    NetworkSpec, NodePool, ResourceSpec, Secret, Spec, StorageClass, StorageSpec,
};
pub use status::{
    AccountOutputs, ClusterOutputs, ErrorDetail, NetworkOutputs, OutputValue, Outputs, Phase,
    ResourceOutputs, Status, StorageOutputs,
};
pub use task::{Lease, Operation, Task, TaskInfo, TaskResult, TaskState};
