//! Observed state of an entity

use super::task::Operation;
use crate::error::{CoreError, ErrorKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle phase of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Pending,
    Provisioning,
    Active,
    Updating,
    Deleting,
    Deleted,
    Failed,
}

impl Phase {
    /// Allowed phase graph. Same-phase writes are always accepted.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Provisioning)
                | (Pending, Deleting)
                | (Pending, Deleted)
                | (Provisioning, Active)
                | (Provisioning, Failed)
                | (Active, Updating)
                | (Active, Deleting)
                | (Updating, Active)
                | (Updating, Failed)
                | (Deleting, Deleted)
                | (Deleting, Failed)
                | (Failed, Pending)
                | (Failed, Deleting)
        )
    }

    /// A task for the entity is (optimistically) in flight
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Phase::Provisioning | Phase::Updating | Phase::Deleting
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Pending => write!(f, "pending"),
            Phase::Provisioning => write!(f, "provisioning"),
            Phase::Active => write!(f, "active"),
            Phase::Updating => write!(f, "updating"),
            Phase::Deleting => write!(f, "deleting"),
            Phase::Deleted => write!(f, "deleted"),
            Phase::Failed => write!(f, "failed"),
        }
    }
}

/// Typed value of an IaC output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    String(String),
    List(Vec<OutputValue>),
    Object(BTreeMap<String, OutputValue>),
}

impl OutputValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OutputValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// String items of a list value
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        match self {
            OutputValue::List(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }
}

pub type Outputs = BTreeMap<String, OutputValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOutputs {
    /// Cloud-side account / subscription / project identifier
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOutputs {
    pub vpc_id: String,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterOutputs {
    pub cluster_name: String,
    /// API server endpoint
    pub endpoint: String,
    /// Base64 encoded cluster CA bundle
    #[serde(default)]
    pub ca_certificate: Option<String>,
    /// Add-ons installed after provisioning
    #[serde(default)]
    pub addons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOutputs {
    pub name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Entity-specific status fields parsed from provider outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceOutputs {
    Account(AccountOutputs),
    Network(NetworkOutputs),
    Kubernetes(ClusterOutputs),
    Storage(StorageOutputs),
}

/// Error recorded on a failed attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    /// Pipeline stage that failed (e.g. "apply")
    #[serde(default)]
    pub stage: Option<String>,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage: None,
            message: message.into(),
        }
    }

    pub fn at_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "[{}] {}: {}", stage, self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Observed state of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub phase: Phase,

    /// Hash of the last successfully applied spec
    pub applied_spec_hash: Option<String>,

    /// Configuration bundle version last applied
    pub infra_version: Option<String>,

    /// Raw outputs of the last successful apply
    #[serde(default)]
    pub outputs: Outputs,

    #[serde(default)]
    pub details: Option<ResourceOutputs>,

    /// Last error (kept until the next success)
    #[serde(default)]
    pub error: Option<ErrorDetail>,

    /// Consecutive failed attempts
    #[serde(default)]
    pub attempts: u32,

    pub last_transition_at: DateTime<Utc>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            phase: Phase::Pending,
            applied_spec_hash: None,
            infra_version: None,
            outputs: Outputs::new(),
            details: None,
            error: None,
            attempts: 0,
            last_transition_at: Utc::now(),
        }
    }
}

impl Status {
    /// Move to `next`, rejecting moves outside the phase graph
    pub fn transition(&mut self, entity_id: &str, next: Phase, now: DateTime<Utc>) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                entity: entity_id.to_string(),
                from: self.phase,
                to: next,
            });
        }
        if self.phase != next {
            tracing::debug!("{}: {} -> {}", entity_id, self.phase, next);
            self.phase = next;
            self.last_transition_at = now;
        }
        Ok(())
    }

    /// Enter the in-progress phase of `operation`. A no-op when already there.
    pub fn begin(&mut self, entity_id: &str, operation: Operation, now: DateTime<Utc>) -> Result<()> {
        let path: &[Phase] = match (operation, self.phase) {
            (Operation::CreateOrUpdate, Phase::Provisioning | Phase::Updating) => &[],
            (Operation::CreateOrUpdate, Phase::Active) => &[Phase::Updating],
            (Operation::CreateOrUpdate, Phase::Failed) => &[Phase::Pending, Phase::Provisioning],
            (Operation::CreateOrUpdate, _) => &[Phase::Provisioning],
            (Operation::Destroy, Phase::Deleting) => &[],
            // An abandoned create or update has no direct edge to Deleting
            (Operation::Destroy, Phase::Provisioning | Phase::Updating) => {
                &[Phase::Failed, Phase::Deleting]
            }
            (Operation::Destroy, _) => &[Phase::Deleting],
        };
        for phase in path {
            self.transition(entity_id, *phase, now)?;
        }
        Ok(())
    }

    /// Record the end of an attempt of `operation`, landing in `outcome`
    pub fn finish(
        &mut self,
        entity_id: &str,
        operation: Operation,
        outcome: Phase,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.begin(entity_id, operation, now)?;
        self.transition(entity_id, outcome, now)
    }

    pub fn vpc_id(&self) -> Option<&str> {
        match &self.details {
            Some(ResourceOutputs::Network(network)) => Some(network.vpc_id.as_str()),
            _ => None,
        }
    }

    pub fn cluster(&self) -> Option<&ClusterOutputs> {
        match &self.details {
            Some(ResourceOutputs::Kubernetes(cluster)) => Some(cluster),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_graph() {
        assert!(Phase::Pending.can_transition_to(Phase::Provisioning));
        assert!(Phase::Provisioning.can_transition_to(Phase::Active));
        assert!(Phase::Active.can_transition_to(Phase::Updating));
        assert!(Phase::Failed.can_transition_to(Phase::Pending));
        assert!(!Phase::Failed.can_transition_to(Phase::Active));
        assert!(!Phase::Deleted.can_transition_to(Phase::Pending));
        assert!(!Phase::Pending.can_transition_to(Phase::Active));
        assert!(Phase::Deleted.can_transition_to(Phase::Deleted));
    }

    #[test]
    fn test_transition_updates_timestamp() {
        let mut status = Status::default();
        let now = Utc::now() + chrono::Duration::seconds(10);
        status.transition("e", Phase::Provisioning, now).unwrap();
        assert_eq!(status.phase, Phase::Provisioning);
        assert_eq!(status.last_transition_at, now);

        let err = status.transition("e", Phase::Deleted, now).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[test]
    fn test_begin_walks_the_phase_graph() {
        let now = Utc::now();
        let mut status = Status::default();
        status.begin("e", Operation::CreateOrUpdate, now).unwrap();
        assert_eq!(status.phase, Phase::Provisioning);
        status.begin("e", Operation::CreateOrUpdate, now).unwrap();
        assert_eq!(status.phase, Phase::Provisioning);

        status.phase = Phase::Failed;
        status.begin("e", Operation::CreateOrUpdate, now).unwrap();
        assert_eq!(status.phase, Phase::Provisioning);

        status.phase = Phase::Active;
        status.begin("e", Operation::CreateOrUpdate, now).unwrap();
        assert_eq!(status.phase, Phase::Updating);

        status.phase = Phase::Deleted;
        assert!(status.begin("e", Operation::CreateOrUpdate, now).is_err());
        assert!(status.begin("e", Operation::Destroy, now).is_err());
    }

    #[test]
    fn test_destroy_interrupts_work_in_progress() {
        let now = Utc::now();
        for phase in [Phase::Provisioning, Phase::Updating] {
            let mut status = Status {
                phase,
                ..Default::default()
            };
            status.begin("e", Operation::Destroy, now).unwrap();
            assert_eq!(status.phase, Phase::Deleting, "from {}", phase);
        }

        let mut status = Status {
            phase: Phase::Updating,
            ..Default::default()
        };
        status
            .finish("e", Operation::Destroy, Phase::Deleted, now)
            .unwrap();
        assert_eq!(status.phase, Phase::Deleted);
    }

    #[test]
    fn test_finish_from_any_resting_phase() {
        let now = Utc::now();
        let mut status = Status {
            phase: Phase::Failed,
            ..Default::default()
        };
        status
            .finish("e", Operation::CreateOrUpdate, Phase::Failed, now)
            .unwrap();
        assert_eq!(status.phase, Phase::Failed);

        status
            .finish("e", Operation::Destroy, Phase::Deleted, now)
            .unwrap();
        assert_eq!(status.phase, Phase::Deleted);
    }

    #[test]
    fn test_output_value_shapes() {
        let raw = serde_json::json!({
            "vpc_id": "vpc-123",
            "subnets": ["subnet-a", "subnet-b"],
            "tags": {"team": "infra"}
        });
        let outputs: Outputs = serde_json::from_value(raw).unwrap();
        assert_eq!(outputs["vpc_id"].as_str(), Some("vpc-123"));
        assert_eq!(
            outputs["subnets"].as_string_list(),
            Some(vec!["subnet-a".to_string(), "subnet-b".to_string()])
        );
        assert!(matches!(outputs["tags"], OutputValue::Object(_)));
    }
}
