//! Entity API
//!
//! The user-facing side of the store: create, read, update the desired spec
//! and request deletion. Status is read-only from here; only task completion
//! writes it.

use crate::error::{ControlError, Result};
use crate::tasks::TaskManager;
use chrono::Utc;
use infraflow_core::{
    CoreError, Entity, EntityDecl, EntityStore, Phase, Spec, Task, mutation,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Outcome of seeding the store from a manifest
#[derive(Debug, Default, Serialize)]
pub struct ManifestReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
}

#[derive(Clone)]
pub struct EntityService {
    store: Arc<dyn EntityStore>,
    tasks: Arc<TaskManager>,
    /// Held from a parent or child check until the write that depends on it
    hierarchy: Arc<Mutex<()>>,
}

impl EntityService {
    pub fn new(store: Arc<dyn EntityStore>, tasks: Arc<TaskManager>) -> Self {
        Self {
            store,
            tasks,
            hierarchy: Arc::new(Mutex::new(())),
        }
    }

    pub async fn create(&self, decl: EntityDecl) -> Result<Entity> {
        decl.spec.validate()?;
        let kind = decl.spec.kind();
        let _hierarchy = self.hierarchy.lock().await;

        match (&decl.parent, kind.is_root()) {
            (Some(_), true) => {
                return Err(ControlError::InvalidRequest(format!(
                    "{} {} cannot have a parent",
                    kind, decl.id
                )));
            }
            (None, false) => {
                return Err(ControlError::InvalidRequest(format!(
                    "{} {} requires a parent",
                    kind, decl.id
                )));
            }
            (Some(parent_id), false) => {
                let parent = self.store.require(parent_id).await?;
                if !kind.parent_kinds().contains(&parent.kind()) {
                    return Err(ControlError::InvalidRequest(format!(
                        "a {} cannot be placed under {} {}",
                        kind,
                        parent.kind(),
                        parent.id
                    )));
                }
                if parent.is_deletion_requested() || parent.status.phase == Phase::Deleted {
                    return Err(ControlError::InvalidRequest(format!(
                        "parent {} is being deleted",
                        parent.id
                    )));
                }
                if parent.spec.cloud != decl.spec.cloud {
                    return Err(ControlError::InvalidRequest(format!(
                        "{} is on {}, parent {} is on {}",
                        decl.id, decl.spec.cloud, parent.id, parent.spec.cloud
                    )));
                }
            }
            (None, true) => {}
        }

        let entity = decl.into_entity();
        self.store.insert(entity.clone()).await?;
        tracing::info!("Created {} {}", entity.kind(), entity.id);
        Ok(entity)
    }

    pub async fn get(&self, id: &str) -> Result<Entity> {
        Ok(self.store.require(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Entity>> {
        Ok(self.store.list().await?)
    }

    /// Replace the desired spec. Kind and cloud are fixed at creation.
    ///
    /// Resets the failure counter, so a frozen entity becomes eligible again.
    pub async fn update_spec(&self, id: &str, spec: Spec) -> Result<Entity> {
        spec.validate()?;
        let entity_id = id.to_string();
        let updated = self
            .store
            .modify(
                id,
                mutation(move |e| {
                    if e.is_deletion_requested() {
                        return Err(CoreError::InvalidSpec(format!(
                            "{} is being deleted",
                            entity_id
                        )));
                    }
                    if e.kind() != spec.kind() || e.spec.cloud != spec.cloud {
                        return Err(CoreError::InvalidSpec(format!(
                            "{} is a {} on {}; kind and cloud cannot change",
                            entity_id,
                            e.kind(),
                            e.spec.cloud
                        )));
                    }
                    e.spec = spec;
                    e.status.attempts = 0;
                    Ok(())
                }),
            )
            .await?;
        tracing::info!("Updated spec of {}", id);
        Ok(updated)
    }

    /// Mark an entity for destruction. The controller enqueues the destroy.
    ///
    /// Fails with `DependencyOrder` while any child is not `Deleted`; no task
    /// is created in that case.
    pub async fn request_delete(&self, id: &str) -> Result<Entity> {
        let _hierarchy = self.hierarchy.lock().await;
        self.store.require(id).await?;
        let blockers: Vec<String> = self
            .store
            .children(id)
            .await?
            .into_iter()
            .filter(|c| c.status.phase != Phase::Deleted)
            .map(|c| format!("{} {} ({})", c.kind(), c.id, c.status.phase))
            .collect();
        if !blockers.is_empty() {
            return Err(ControlError::DependencyOrder(format!(
                "{} still has children: {}",
                id,
                blockers.join(", ")
            )));
        }

        let now = Utc::now();
        let entity = self
            .store
            .modify(
                id,
                mutation(move |e| {
                    if e.metadata.deletion_requested_at.is_none() {
                        e.metadata.deletion_requested_at = Some(now);
                        // Create or update failures do not count against destroy
                        e.status.attempts = 0;
                    }
                    Ok(())
                }),
            )
            .await?;
        tracing::info!("Deletion requested for {}", id);
        Ok(entity)
    }

    /// Unfreeze a `Failed` entity
    pub async fn retry(&self, id: &str) -> Result<Entity> {
        let entity_id = id.to_string();
        let entity = self
            .store
            .modify(
                id,
                mutation(move |e| {
                    if e.status.phase != Phase::Failed {
                        return Err(CoreError::InvalidSpec(format!(
                            "{} is {}, only failed entities can be retried",
                            entity_id, e.status.phase
                        )));
                    }
                    e.status.attempts = 0;
                    Ok(())
                }),
            )
            .await?;
        tracing::info!("Retry requested for {}", id);
        Ok(entity)
    }

    /// Hard delete a `Deleted` entity that no other entity references
    pub async fn purge(&self, id: &str) -> Result<Entity> {
        let _hierarchy = self.hierarchy.lock().await;
        let children = self.store.children(id).await?;
        if !children.is_empty() {
            return Err(ControlError::DependencyOrder(format!(
                "{} is still referenced by {}",
                id,
                children
                    .iter()
                    .map(|c| c.id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        let removed = self.store.remove(id).await?;
        tracing::info!("Purged {}", id);
        Ok(removed)
    }

    pub async fn history(&self, id: &str) -> Result<Vec<Task>> {
        self.store.require(id).await?;
        Ok(self.tasks.history(id).await)
    }

    /// Create or update every declaration, parents before children
    pub async fn apply_manifest(&self, decls: Vec<EntityDecl>) -> Result<ManifestReport> {
        let mut report = ManifestReport::default();
        for decl in decls {
            let id = decl.id.clone();
            match self.store.get(&id).await? {
                None => {
                    self.create(decl).await?;
                    report.created.push(id);
                }
                Some(existing) if existing.spec.hash() != decl.spec.hash() => {
                    self.update_spec(&id, decl.spec).await?;
                    report.updated.push(id);
                }
                Some(_) => report.unchanged.push(id),
            }
        }
        Ok(report)
    }
}
