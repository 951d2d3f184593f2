//! Reconciliation loop
//!
//! Every tick compares desired and observed state of each entity and enqueues
//! at most one task per entity. The loop keeps no memory between ticks: a
//! failed enqueue or a lost task is simply seen again on the next one.

use crate::error::{ControlError, Result};
use crate::lineage;
use crate::span;
use crate::tasks::TaskManager;
use chrono::{DateTime, Utc};
use infraflow_config::ControllerConfig;
use infraflow_core::{Entity, EntityStore, Operation, Phase, mutation};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior};

/// Why an entity got no task this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Deleted,
    TaskInFlight,
    ParentNotReady,
    ChildrenNotDeleted,
    Backoff,
    InSync,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub enqueued: Vec<(String, Operation)>,
    pub skipped: Vec<(String, SkipReason)>,
    /// `Failed` entities waiting for manual intervention
    pub frozen: Vec<String>,
    /// Never-provisioned entities deleted without running a task
    pub finalized: Vec<String>,
    pub errors: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn skip_reason(&self, entity_id: &str) -> Option<SkipReason> {
        self.skipped
            .iter()
            .find(|(id, _)| id == entity_id)
            .map(|(_, reason)| *reason)
    }

    pub fn was_enqueued(&self, entity_id: &str) -> bool {
        self.enqueued.iter().any(|(id, _)| id == entity_id)
    }
}

enum Decision {
    Enqueue(Operation),
    Skip(SkipReason),
    Frozen,
    Finalize,
}

pub struct Controller {
    store: Arc<dyn EntityStore>,
    tasks: Arc<TaskManager>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(store: Arc<dyn EntityStore>, tasks: Arc<TaskManager>, config: ControllerConfig) -> Self {
        Self {
            store,
            tasks,
            config,
        }
    }

    /// Run one reconciliation pass over every entity
    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for snapshot in self.store.list().await? {
            let id = snapshot.id;
            match self.reconcile_entity(&id, now).await {
                Ok(Decision::Enqueue(operation)) => report.enqueued.push((id, operation)),
                Ok(Decision::Skip(reason)) => report.skipped.push((id, reason)),
                Ok(Decision::Frozen) => report.frozen.push(id),
                Ok(Decision::Finalize) => report.finalized.push(id),
                Err(e) => {
                    tracing::warn!("Reconcile {} failed: {}", id, e);
                    report.errors.push((id, e.to_string()));
                }
            }
        }

        if !report.enqueued.is_empty() || !report.errors.is_empty() {
            tracing::info!(
                "Reconciled: {} enqueued, {} skipped, {} frozen, {} errors",
                report.enqueued.len(),
                report.skipped.len(),
                report.frozen.len(),
                report.errors.len()
            );
        }
        Ok(report)
    }

    async fn reconcile_entity(&self, id: &str, now: DateTime<Utc>) -> Result<Decision> {
        if self.tasks.active_for(id).await.is_some() {
            return Ok(Decision::Skip(SkipReason::TaskInFlight));
        }
        // Re-read: a task may have completed since the listing
        let Some(entity) = self.store.get(id).await? else {
            return Ok(Decision::Skip(SkipReason::Deleted));
        };

        let decision = self.decide(&entity, now).await?;
        match decision {
            Decision::Enqueue(operation) => match self.tasks.enqueue(&entity, operation, now).await {
                Ok(_) => Ok(decision),
                Err(ControlError::Conflict { .. }) => Ok(Decision::Skip(SkipReason::TaskInFlight)),
                Err(e) => Err(e),
            },
            Decision::Finalize => {
                let entity_id = entity.id.clone();
                self.store
                    .modify(
                        &entity.id,
                        mutation(move |e| e.status.transition(&entity_id, Phase::Deleted, now)),
                    )
                    .await?;
                tracing::info!("{} was never provisioned, marked deleted", entity.id);
                Ok(decision)
            }
            other => Ok(other),
        }
    }

    async fn decide(&self, entity: &Entity, now: DateTime<Utc>) -> Result<Decision> {
        let status = &entity.status;
        if status.phase == Phase::Deleted {
            return Ok(Decision::Skip(SkipReason::Deleted));
        }

        // Deletion outranks whatever froze the last create or update
        if entity.is_deletion_requested() {
            let children = self.store.children(&entity.id).await?;
            if children.iter().any(|c| c.status.phase != Phase::Deleted) {
                return Ok(Decision::Skip(SkipReason::ChildrenNotDeleted));
            }
            if status.phase == Phase::Pending {
                return Ok(Decision::Finalize);
            }
            if let Some(held) = self.hold_failed(entity, now) {
                return Ok(held);
            }
            return Ok(Decision::Enqueue(Operation::Destroy));
        }

        if let Some(held) = self.hold_failed(entity, now) {
            return Ok(held);
        }

        if !self.needs_apply(entity, now) {
            return Ok(Decision::Skip(SkipReason::InSync));
        }

        let ancestors = lineage::ancestors(self.store.as_ref(), entity).await?;
        if let Some(blocker) = lineage::first_inactive(&ancestors) {
            tracing::debug!(
                "{} waits for {} ({})",
                entity.id,
                blocker.id,
                blocker.status.phase
            );
            return Ok(Decision::Skip(SkipReason::ParentNotReady));
        }
        Ok(Decision::Enqueue(Operation::CreateOrUpdate))
    }

    /// `Frozen` or backing off, for a `Failed` entity
    fn hold_failed(&self, entity: &Entity, now: DateTime<Utc>) -> Option<Decision> {
        let status = &entity.status;
        if status.phase != Phase::Failed {
            return None;
        }
        if self.is_frozen(entity) {
            return Some(Decision::Frozen);
        }
        let elapsed = (now - status.last_transition_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if elapsed < self.config.backoff(status.attempts) {
            return Some(Decision::Skip(SkipReason::Backoff));
        }
        None
    }

    /// Out of attempts, or failed with an error a retry cannot fix.
    /// Updating the spec, an explicit retry or a new deletion request
    /// resets `attempts`.
    fn is_frozen(&self, entity: &Entity) -> bool {
        let status = &entity.status;
        if status.attempts >= self.config.max_attempts {
            return true;
        }
        status.attempts > 0
            && status
                .error
                .as_ref()
                .is_some_and(|e| !e.kind.is_retryable())
    }

    fn needs_apply(&self, entity: &Entity, now: DateTime<Utc>) -> bool {
        let status = &entity.status;
        match status.phase {
            Phase::Pending | Phase::Failed => true,
            // In progress without a task: the task was lost, start over
            Phase::Provisioning | Phase::Updating => true,
            Phase::Deleting | Phase::Deleted => false,
            Phase::Active => {
                entity.has_drift()
                    || self
                        .config
                        .resync
                        .is_some_and(|every| now - status.last_transition_at >= span(every))
            }
        }
    }

    /// Tick until `shutdown` flips to `true`
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("Controller started (interval {:?})", self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Controller stopped");
    }

    async fn tick(&self) {
        let now = Utc::now();
        match self.tasks.reclaim_expired(now).await {
            Ok(0) => {}
            Ok(n) => tracing::warn!("Reclaimed {} task(s) with expired leases", n),
            Err(e) => tracing::error!("Lease reclaim failed: {}", e),
        }
        if let Err(e) = self.tasks.purge_archived(now).await {
            tracing::warn!("Purging archived tasks failed: {}", e);
        }
        if let Err(e) = self.reconcile_once(now).await {
            tracing::error!("Reconciliation failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{account, activate, network};
    use infraflow_config::TaskConfig;
    use infraflow_core::{ErrorDetail, ErrorKind, MemoryEntityStore, TaskResult};

    struct Harness {
        store: Arc<MemoryEntityStore>,
        tasks: Arc<TaskManager>,
        controller: Controller,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryEntityStore::new());
        store.insert(activate(account("acct"))).await.unwrap();
        let tasks = Arc::new(TaskManager::new(store.clone(), TaskConfig::default()));
        let controller = Controller::new(store.clone(), tasks.clone(), ControllerConfig::default());
        Harness {
            store,
            tasks,
            controller,
        }
    }

    async fn fail_current(h: &Harness, entity_id: &str, kind: ErrorKind, now: DateTime<Utc>) {
        let task = h.tasks.active_for(entity_id).await.unwrap();
        h.tasks.lease("w", 10, now).await.unwrap();
        h.tasks
            .complete(task.id, "w", TaskResult::failed(ErrorDetail::new(kind, "boom")), now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_entity_is_enqueued_once() {
        let h = harness().await;
        h.store.insert(network("net", "acct")).await.unwrap();
        let now = Utc::now();

        let report = h.controller.reconcile_once(now).await.unwrap();
        assert!(report.was_enqueued("net"));
        assert_eq!(report.skip_reason("acct"), Some(SkipReason::InSync));
        assert_eq!(
            h.store.require("net").await.unwrap().status.phase,
            Phase::Provisioning
        );

        let report = h.controller.reconcile_once(now).await.unwrap();
        assert_eq!(report.skip_reason("net"), Some(SkipReason::TaskInFlight));
        assert_eq!(h.tasks.history("net").await.len(), 1);
    }

    #[tokio::test]
    async fn test_child_waits_for_parent() {
        let h = harness().await;
        h.store.insert(network("net", "acct")).await.unwrap();
        h.store
            .insert(crate::testing::cluster("k8s", "net"))
            .await
            .unwrap();

        let report = h.controller.reconcile_once(Utc::now()).await.unwrap();
        assert!(report.was_enqueued("net"));
        assert_eq!(report.skip_reason("k8s"), Some(SkipReason::ParentNotReady));
        assert!(h.tasks.active_for("k8s").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_entity_backs_off_then_retries() {
        let h = harness().await;
        h.store.insert(network("net", "acct")).await.unwrap();
        let now = Utc::now();
        h.controller.reconcile_once(now).await.unwrap();
        fail_current(&h, "net", ErrorKind::Timeout, now).await;

        let report = h
            .controller
            .reconcile_once(now + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(report.skip_reason("net"), Some(SkipReason::Backoff));

        let report = h
            .controller
            .reconcile_once(now + chrono::Duration::seconds(31))
            .await
            .unwrap();
        assert!(report.was_enqueued("net"));
        let task = h.tasks.active_for("net").await.unwrap();
        assert_eq!(task.attempt, 2);
    }

    #[tokio::test]
    async fn test_entity_freezes_after_max_attempts() {
        let h = harness().await;
        h.store.insert(network("net", "acct")).await.unwrap();
        let mut now = Utc::now();

        for _ in 0..5 {
            let report = h.controller.reconcile_once(now).await.unwrap();
            assert!(report.was_enqueued("net"));
            fail_current(&h, "net", ErrorKind::ExecutionError, now).await;
            now += chrono::Duration::hours(1);
        }

        let report = h.controller.reconcile_once(now).await.unwrap();
        assert_eq!(report.frozen, vec!["net".to_string()]);
        assert!(h.tasks.active_for("net").await.is_none());
    }

    #[tokio::test]
    async fn test_non_retryable_failure_freezes_immediately() {
        let h = harness().await;
        h.store.insert(network("net", "acct")).await.unwrap();
        let now = Utc::now();
        h.controller.reconcile_once(now).await.unwrap();
        fail_current(&h, "net", ErrorKind::InvalidSpec, now).await;

        let report = h
            .controller
            .reconcile_once(now + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(report.frozen, vec!["net".to_string()]);
    }

    #[tokio::test]
    async fn test_drift_on_active_entity_triggers_update() {
        let h = harness().await;
        h.store.insert(activate(network("net", "acct"))).await.unwrap();
        let now = Utc::now();

        let report = h.controller.reconcile_once(now).await.unwrap();
        assert_eq!(report.skip_reason("net"), Some(SkipReason::InSync));

        h.store
            .modify(
                "net",
                mutation(|e| {
                    if let infraflow_core::ResourceSpec::Network(n) = &mut e.spec.resource {
                        n.cidr = "10.1.0.0/16".to_string();
                    }
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let report = h.controller.reconcile_once(now).await.unwrap();
        assert!(report.was_enqueued("net"));
        assert_eq!(h.store.require("net").await.unwrap().status.phase, Phase::Updating);
    }

    #[tokio::test]
    async fn test_resync_reapplies_active_entities() {
        let store = Arc::new(MemoryEntityStore::new());
        store.insert(activate(account("acct"))).await.unwrap();
        store.insert(activate(network("net", "acct"))).await.unwrap();
        let tasks = Arc::new(TaskManager::new(store.clone(), TaskConfig::default()));
        let controller = Controller::new(
            store.clone(),
            tasks.clone(),
            ControllerConfig {
                resync: Some(Duration::from_secs(3600)),
                ..Default::default()
            },
        );

        let report = controller.reconcile_once(Utc::now()).await.unwrap();
        assert_eq!(report.skip_reason("net"), Some(SkipReason::InSync));

        let report = controller
            .reconcile_once(Utc::now() + chrono::Duration::hours(2))
            .await
            .unwrap();
        assert!(report.was_enqueued("net"));
    }

    #[tokio::test]
    async fn test_deletion_of_never_provisioned_entity() {
        let h = harness().await;
        let mut net = network("net", "acct");
        net.metadata.deletion_requested_at = Some(Utc::now());
        h.store.insert(net).await.unwrap();

        let report = h.controller.reconcile_once(Utc::now()).await.unwrap();
        assert_eq!(report.finalized, vec!["net".to_string()]);
        assert_eq!(h.store.require("net").await.unwrap().status.phase, Phase::Deleted);
        assert!(h.tasks.history("net").await.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_waits_for_children() {
        let h = harness().await;
        let mut net = activate(network("net", "acct"));
        net.metadata.deletion_requested_at = Some(Utc::now());
        h.store.insert(net).await.unwrap();
        h.store
            .insert(activate(crate::testing::storage("bucket", "net")))
            .await
            .unwrap();

        let report = h.controller.reconcile_once(Utc::now()).await.unwrap();
        assert_eq!(report.skip_reason("net"), Some(SkipReason::ChildrenNotDeleted));

        h.store
            .modify(
                "bucket",
                mutation(|e| {
                    e.status.phase = Phase::Deleted;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        let report = h.controller.reconcile_once(Utc::now()).await.unwrap();
        assert!(report.enqueued.contains(&("net".to_string(), Operation::Destroy)));
        assert_eq!(h.store.require("net").await.unwrap().status.phase, Phase::Deleting);
    }

    #[tokio::test]
    async fn test_deletion_interrupts_abandoned_work() {
        let h = harness().await;
        for (id, phase) in [("net-a", Phase::Provisioning), ("net-b", Phase::Updating)] {
            let mut net = network(id, "acct");
            net.status.phase = phase;
            net.metadata.deletion_requested_at = Some(Utc::now());
            h.store.insert(net).await.unwrap();
        }

        let report = h.controller.reconcile_once(Utc::now()).await.unwrap();
        for id in ["net-a", "net-b"] {
            assert!(report.enqueued.contains(&(id.to_string(), Operation::Destroy)), "{}", id);
            assert_eq!(h.store.require(id).await.unwrap().status.phase, Phase::Deleting);
        }
    }

    #[tokio::test]
    async fn test_deletion_of_frozen_entity_runs_destroy() {
        let h = harness().await;
        let service = crate::EntityService::new(h.store.clone(), h.tasks.clone());
        h.store.insert(network("net", "acct")).await.unwrap();
        let now = Utc::now();
        h.controller.reconcile_once(now).await.unwrap();
        fail_current(&h, "net", ErrorKind::InvalidSpec, now).await;

        let later = now + chrono::Duration::hours(1);
        let report = h.controller.reconcile_once(later).await.unwrap();
        assert_eq!(report.frozen, vec!["net".to_string()]);

        service.request_delete("net").await.unwrap();
        let report = h.controller.reconcile_once(later).await.unwrap();
        assert!(report.enqueued.contains(&("net".to_string(), Operation::Destroy)));
        assert_eq!(h.store.require("net").await.unwrap().status.phase, Phase::Deleting);

        // A failed destroy still backs off
        fail_current(&h, "net", ErrorKind::ExecutionError, later).await;
        let report = h.controller.reconcile_once(later).await.unwrap();
        assert_eq!(report.skip_reason("net"), Some(SkipReason::Backoff));
        let report = h
            .controller
            .reconcile_once(later + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(report.enqueued.contains(&("net".to_string(), Operation::Destroy)));
    }
}
