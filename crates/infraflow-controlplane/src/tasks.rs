//! Task Manager
//!
//! Durable queue of provisioning tasks. At most one non-terminal task exists
//! per entity; that single rule is what serializes work on an entity; nothing
//! holds a lock across the long-running deployer call. Completion is the only
//! path that writes a task outcome onto entity status.

use crate::error::{ControlError, Result};
use crate::lineage;
use crate::span;
use chrono::{DateTime, Utc};
use infraflow_config::TaskConfig;
use infraflow_core::{
    CoreError, Entity, EntityStore, ErrorDetail, ErrorKind, Lease, Operation, Outputs, Phase,
    StateFile, Task, TaskResult, TaskState, mutation,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskTable {
    tasks: BTreeMap<Uuid, Task>,
    /// Last attempt number handed out per entity
    #[serde(default)]
    attempts: BTreeMap<String, u32>,
}

impl TaskTable {
    fn active_for(&self, entity_id: &str) -> Option<&Task> {
        self.tasks
            .values()
            .find(|t| t.entity_id == entity_id && !t.is_terminal())
    }

    fn get(&self, task_id: Uuid) -> Result<&Task> {
        self.tasks
            .get(&task_id)
            .ok_or(ControlError::TaskNotFound(task_id))
    }

    fn get_mut(&mut self, task_id: Uuid) -> Result<&mut Task> {
        self.tasks
            .get_mut(&task_id)
            .ok_or(ControlError::TaskNotFound(task_id))
    }

    /// Undo an enqueue that could not be completed
    fn withdraw(&mut self, task_id: Uuid, entity_id: &str, previous: Option<u32>) {
        self.tasks.remove(&task_id);
        match previous {
            Some(attempt) => self.attempts.insert(entity_id.to_string(), attempt),
            None => self.attempts.remove(entity_id),
        };
    }

    /// Task must be leased to `worker_id` and not finished yet
    fn owned_mut(&mut self, task_id: Uuid, worker_id: &str, action: &'static str) -> Result<&mut Task> {
        let task = self.get_mut(task_id)?;
        if task.is_terminal() {
            return Err(ControlError::InvalidTaskState {
                task: task_id,
                state: task.state,
                action,
            });
        }
        match &task.lease {
            Some(lease) if lease.worker_id == worker_id => Ok(task),
            _ => Err(ControlError::LeaseLost {
                task: task_id,
                worker: worker_id.to_string(),
            }),
        }
    }
}

pub struct TaskManager {
    table: Mutex<TaskTable>,
    store: Arc<dyn EntityStore>,
    config: TaskConfig,
    file: Option<StateFile>,
}

impl TaskManager {
    /// In-memory queue
    pub fn new(store: Arc<dyn EntityStore>, config: TaskConfig) -> Self {
        Self {
            table: Mutex::new(TaskTable::default()),
            store,
            config,
            file: None,
        }
    }

    /// Queue persisted to `path`; tasks still leased when the daemon stopped
    /// are reclaimed once their lease expires.
    pub async fn open(
        store: Arc<dyn EntityStore>,
        config: TaskConfig,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let file = StateFile::new(path);
        let table: TaskTable = file.load().await?;
        tracing::info!(
            "Opened task queue {} ({} tasks)",
            file.path().display(),
            table.tasks.len()
        );
        Ok(Self {
            table: Mutex::new(table),
            store,
            config,
            file: Some(file),
        })
    }

    async fn persist(&self, table: &TaskTable) -> Result<()> {
        if let Some(file) = &self.file {
            file.save(table).await?;
        }
        Ok(())
    }

    /// Queue a task for `entity` and move the entity into the matching
    /// in-progress phase.
    ///
    /// Fails with `Conflict` while another task for the entity is not terminal.
    pub async fn enqueue(
        &self,
        entity: &Entity,
        operation: Operation,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let mut table = self.table.lock().await;
        if let Some(active) = table.active_for(&entity.id) {
            return Err(ControlError::Conflict {
                entity: entity.id.clone(),
                task: active.id,
            });
        }

        let attempt = table.attempts.get(&entity.id).copied().unwrap_or(0) + 1;
        let task = Task::new(
            entity,
            operation,
            attempt,
            now,
            now + span(self.config.deadline),
        );

        // The task goes to disk before the phase moves, so an entity is
        // never left in progress with nothing queued behind it.
        table.tasks.insert(task.id, task.clone());
        let previous = table.attempts.insert(entity.id.clone(), attempt);
        if let Err(e) = self.persist(&table).await {
            table.withdraw(task.id, &entity.id, previous);
            return Err(e);
        }

        let id = entity.id.clone();
        let begun = self
            .store
            .modify(
                &entity.id,
                mutation(move |e| e.status.begin(&id, operation, now)),
            )
            .await;
        if let Err(e) = begun {
            table.withdraw(task.id, &entity.id, previous);
            if let Err(persist) = self.persist(&table).await {
                tracing::warn!("Withdrawing task {} was not persisted: {}", task.id, persist);
            }
            return Err(e.into());
        }

        tracing::info!(
            "Queued {} for {} (task {}, attempt {})",
            operation,
            entity.id,
            task.id,
            attempt
        );
        Ok(task)
    }

    /// Hand up to `count` queued tasks to `worker_id`, oldest first
    pub async fn lease(&self, worker_id: &str, count: usize, now: DateTime<Utc>) -> Result<Vec<Task>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut table = self.table.lock().await;

        let mut queued: Vec<(DateTime<Utc>, Uuid)> = table
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Queued)
            .map(|t| (t.created_at, t.id))
            .collect();
        queued.sort();

        let expires_at = now + span(self.config.lease_timeout);
        let mut leased = Vec::new();
        for (_, id) in queued.into_iter().take(count) {
            let task = table.get_mut(id)?;
            task.state = TaskState::Dispatched;
            task.lease = Some(Lease {
                worker_id: worker_id.to_string(),
                expires_at,
            });
            leased.push(task.clone());
        }

        if !leased.is_empty() {
            self.persist(&table).await?;
            tracing::debug!("{} leased {} task(s)", worker_id, leased.len());
        }
        Ok(leased)
    }

    /// Worker confirms it started the task. The execution deadline counts
    /// from here; time spent queued or waiting for a reclaim is not charged.
    pub async fn acknowledge(&self, task_id: Uuid, worker_id: &str, now: DateTime<Utc>) -> Result<Task> {
        let lease_timeout = span(self.config.lease_timeout);
        let deadline = span(self.config.deadline);
        let mut table = self.table.lock().await;
        let task = table.owned_mut(task_id, worker_id, "acknowledge")?;
        task.state = TaskState::Running;
        task.deadline = now + deadline;
        if let Some(lease) = task.lease.as_mut() {
            lease.expires_at = now + lease_timeout;
        }
        let task = task.clone();
        self.persist(&table).await?;
        Ok(task)
    }

    /// Extend the lease while the deployer call is in flight
    pub async fn heartbeat(&self, task_id: Uuid, worker_id: &str, now: DateTime<Utc>) -> Result<Task> {
        let lease_timeout = span(self.config.lease_timeout);
        let mut table = self.table.lock().await;
        let task = table.owned_mut(task_id, worker_id, "heartbeat")?;
        if let Some(lease) = task.lease.as_mut() {
            lease.expires_at = now + lease_timeout;
        }
        let task = task.clone();
        self.persist(&table).await?;
        Ok(task)
    }

    /// Return tasks whose lease expired to the queue
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut table = self.table.lock().await;
        let mut reclaimed = 0;
        for task in table.tasks.values_mut() {
            let expired = matches!(task.state, TaskState::Dispatched | TaskState::Running)
                && task.lease.as_ref().is_some_and(|l| l.expires_at <= now);
            if expired {
                tracing::warn!(
                    "Lease on task {} ({}) expired, returning it to the queue",
                    task.id,
                    task.entity_id
                );
                task.state = TaskState::Queued;
                task.lease = None;
                task.reclaims += 1;
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            self.persist(&table).await?;
        }
        Ok(reclaimed)
    }

    /// Finish a task and write its outcome onto the entity status.
    ///
    /// A successful create whose ancestors are no longer all `Active` is
    /// recorded as a `ParentNotReady` failure.
    pub async fn complete(
        &self,
        task_id: Uuid,
        worker_id: &str,
        result: TaskResult,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let mut table = self.table.lock().await;
        let task = table.owned_mut(task_id, worker_id, "complete")?.clone();

        let result = self.gate(&task, result).await;
        let applied = self.apply_status(&task, &result, now).await;

        let done = {
            let record = table.get_mut(task_id)?;
            record.state = if result.success {
                TaskState::Succeeded
            } else {
                TaskState::Failed
            };
            record.lease = None;
            record.completed_at = Some(now);
            record.result = Some(result);
            record.clone()
        };
        self.persist(&table).await?;

        match &done.result {
            Some(TaskResult { success: true, .. }) => {
                tracing::info!("Task {} {} {} succeeded", done.id, done.operation, done.entity_id)
            }
            Some(TaskResult {
                error: Some(error), ..
            }) => tracing::warn!(
                "Task {} {} {} failed: {}",
                done.id,
                done.operation,
                done.entity_id,
                error
            ),
            _ => tracing::warn!("Task {} {} {} failed", done.id, done.operation, done.entity_id),
        }

        applied?;
        Ok(done)
    }

    async fn gate(&self, task: &Task, result: TaskResult) -> TaskResult {
        if !result.success || task.operation != Operation::CreateOrUpdate {
            return result;
        }
        let entity = match self.store.require(&task.entity_id).await {
            Ok(entity) => entity,
            Err(_) => return result,
        };
        match lineage::ancestors(self.store.as_ref(), &entity).await {
            Ok(ancestors) => match lineage::first_inactive(&ancestors) {
                Some(blocker) => TaskResult::failed(ErrorDetail::new(
                    ErrorKind::ParentNotReady,
                    format!("{} {} is {}", blocker.kind(), blocker.id, blocker.status.phase),
                )),
                None => result,
            },
            Err(e) => TaskResult::failed(ErrorDetail::new(e.kind(), e.to_string())),
        }
    }

    async fn apply_status(&self, task: &Task, result: &TaskResult, now: DateTime<Utc>) -> Result<()> {
        let id = task.entity_id.clone();
        let operation = task.operation;
        let spec_hash = task.spec_hash.clone();
        let result = result.clone();

        let write = self
            .store
            .modify(
                &task.entity_id,
                mutation(move |e| {
                    let status = &mut e.status;
                    if result.success {
                        match operation {
                            Operation::CreateOrUpdate => {
                                status.finish(&id, operation, Phase::Active, now)?;
                                status.applied_spec_hash = Some(spec_hash);
                                status.outputs = result.outputs;
                                status.details = result.details;
                                status.infra_version = result.infra_version;
                            }
                            Operation::Destroy => {
                                status.finish(&id, operation, Phase::Deleted, now)?;
                                status.outputs = Outputs::new();
                                status.details = None;
                            }
                        }
                        status.error = None;
                        status.attempts = 0;
                    } else {
                        status.finish(&id, operation, Phase::Failed, now)?;
                        status.error = Some(result.error.unwrap_or_else(|| {
                            ErrorDetail::new(ErrorKind::Internal, "task failed without detail")
                        }));
                        status.attempts += 1;
                    }
                    Ok(())
                }),
            )
            .await;

        match write {
            Ok(_) => Ok(()),
            Err(CoreError::EntityNotFound(id)) => {
                tracing::warn!("Entity {} vanished before task {} completed", id, task.id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Task> {
        self.table.lock().await.get(task_id).cloned()
    }

    /// The non-terminal task of an entity, if any
    pub async fn active_for(&self, entity_id: &str) -> Option<Task> {
        self.table.lock().await.active_for(entity_id).cloned()
    }

    /// All tasks of an entity, oldest first
    pub async fn history(&self, entity_id: &str) -> Vec<Task> {
        let table = self.table.lock().await;
        let mut tasks: Vec<Task> = table
            .tasks
            .values()
            .filter(|t| t.entity_id == entity_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.attempt));
        tasks
    }

    pub async fn list(&self) -> Vec<Task> {
        self.table.lock().await.tasks.values().cloned().collect()
    }

    /// Drop terminal tasks older than the retention window
    pub async fn purge_archived(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - span(self.config.retention);
        let mut table = self.table.lock().await;
        let before = table.tasks.len();
        table
            .tasks
            .retain(|_, t| !(t.is_terminal() && t.completed_at.is_some_and(|at| at < cutoff)));
        let purged = before - table.tasks.len();
        if purged > 0 {
            self.persist(&table).await?;
            tracing::debug!("Purged {} archived task(s)", purged);
        }
        Ok(purged)
    }
}
