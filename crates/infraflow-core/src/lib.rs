//! InfraFlow core
//!
//! Entity and task model for the InfraFlow provisioning control plane.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   enqueue   ┌──────────────┐   lease   ┌──────────────┐
//! │  Controller  │────────────▶│ Task Manager │◀──────────│    Worker    │
//! └──────┬───────┘             └──────┬───────┘           └──────┬───────┘
//!        │ desired                    │ status                   │ RunTask
//! ┌──────▼────────────────────────────▼───────┐           ┌──────▼───────┐
//! │              Entity Store                  │           │   Deployer   │
//! │  Account → Network → Kubernetes / Storage  │           │ (IaC driver) │
//! └────────────────────────────────────────────┘           └──────────────┘
//! ```
//!
//! This crate owns the data that flows between those boxes: entities with
//! their desired [`Spec`] and observed [`Status`], the [`Phase`] machine,
//! [`Task`] records, and the [`EntityStore`] that all status mutations go
//! through.

pub mod error;
pub mod manifest;
pub mod model;
pub mod store;

// Re-exports
pub use error::{CoreError, ErrorKind, Result};
pub use manifest::{EntityDecl, parse_manifest_file, parse_manifest_str};
pub use model::{
    AccessSpec, AccountOutputs, AccountSpec, AddonSpec, CloudType, ClusterOutputs, Entity,
    EntityKind, ErrorDetail, KubernetesSpec, Lease, Metadata, NetworkOutputs, NetworkSpec,
    NodePool, Operation, OutputValue, Outputs, Phase, ResourceOutputs, ResourceSpec, Secret,
    Spec, Status, StorageClass, StorageOutputs, StorageSpec, Task, TaskInfo, TaskResult,
    TaskState,
};
pub use store::{
    EntityMutation, EntityStore, FileEntityStore, MemoryEntityStore, StateFile, mutation,
};
