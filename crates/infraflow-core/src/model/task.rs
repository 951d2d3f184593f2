//! Provisioning tasks and the worker/deployer wire types

use super::entity::{AccessSpec, Entity, EntityKind};
use super::status::{ErrorDetail, Outputs, ResourceOutputs};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a task does to its entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateOrUpdate,
    Destroy,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::CreateOrUpdate => write!(f, "create_or_update"),
            Operation::Destroy => write!(f, "destroy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Dispatched,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Queued => write!(f, "queued"),
            TaskState::Dispatched => write!(f, "dispatched"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// Worker ownership of a dispatched task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

/// One provisioning or destruction attempt for one entity version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub operation: Operation,

    /// Monotonic per entity
    pub attempt: u32,

    pub state: TaskState,

    /// Spec hash the task was created for
    pub spec_hash: String,

    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,

    #[serde(default)]
    pub lease: Option<Lease>,

    /// Number of times an expired lease returned this task to the queue
    #[serde(default)]
    pub reclaims: u32,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub result: Option<TaskResult>,
}

impl Task {
    pub fn new(
        entity: &Entity,
        operation: Operation,
        attempt: u32,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity.id.clone(),
            entity_kind: entity.kind(),
            operation,
            attempt,
            state: TaskState::Queued,
            spec_hash: entity.spec.hash(),
            created_at: now,
            deadline,
            lease: None,
            reclaims: 0,
            completed_at: None,
            result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Task RPC request sent from a worker to a deployer service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: Uuid,
    pub operation: Operation,
    pub attempt: u32,
    pub deadline: DateTime<Utc>,

    /// Entity snapshot at dispatch time
    pub entity: Entity,

    /// Ancestor snapshots, parent first and root account last. Their status
    /// carries the outputs this entity builds on (e.g. the VPC id for a cluster).
    #[serde(default)]
    pub ancestors: Vec<Entity>,

    /// Credentials of the root account
    pub access: AccessSpec,
}

impl TaskInfo {
    pub fn parent(&self) -> Option<&Entity> {
        self.ancestors.first()
    }
}

/// Task RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,

    #[serde(default)]
    pub outputs: Outputs,

    #[serde(default)]
    pub details: Option<ResourceOutputs>,

    /// Bundle version the deployer resolved
    #[serde(default)]
    pub infra_version: Option<String>,

    #[serde(default)]
    pub error: Option<ErrorDetail>,
}

impl TaskResult {
    pub fn succeeded(
        outputs: Outputs,
        details: Option<ResourceOutputs>,
        infra_version: impl Into<String>,
    ) -> Self {
        Self {
            success: true,
            outputs,
            details,
            infra_version: Some(infra_version.into()),
            error: None,
        }
    }

    pub fn failed(error: ErrorDetail) -> Self {
        Self {
            success: false,
            outputs: Outputs::new(),
            details: None,
            infra_version: None,
            error: Some(error),
        }
    }
}
