//! Entity storage
//!
//! Every mutation of an entity, desired side or status side, goes through
//! [`EntityStore::modify`], a read-modify-write applied under the store lock
//! so overlapping reconciliation cycles never lose an update.

mod state_file;

pub use state_file::StateFile;

use crate::error::{CoreError, Result};
use crate::model::{Entity, Phase};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::{Mutex, RwLock};

/// Mutation applied atomically to one entity.
///
/// The closure works on a copy; the copy replaces the stored entity only when
/// the closure returns `Ok`.
pub type EntityMutation<'a> = Box<dyn FnOnce(&mut Entity) -> Result<()> + Send + 'a>;

/// Box a closure as an [`EntityMutation`]
pub fn mutation<'a, F>(f: F) -> EntityMutation<'a>
where
    F: FnOnce(&mut Entity) -> Result<()> + Send + 'a,
{
    Box::new(f)
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Entity>>;

    /// All entities ordered by ID
    async fn list(&self) -> Result<Vec<Entity>>;

    /// Direct children of `parent_id`
    async fn children(&self, parent_id: &str) -> Result<Vec<Entity>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.parent() == Some(parent_id))
            .collect())
    }

    /// Insert a new entity, failing if the ID is taken
    async fn insert(&self, entity: Entity) -> Result<()>;

    /// Atomic read-modify-write keyed by entity ID; returns the stored result
    async fn modify(&self, id: &str, mutation: EntityMutation<'_>) -> Result<Entity>;

    /// Hard delete. Only entities in `Deleted` may be removed.
    async fn remove(&self, id: &str) -> Result<Entity>;

    /// Convenience wrapper returning `EntityNotFound` instead of `None`
    async fn require(&self, id: &str) -> Result<Entity> {
        self.get(id)
            .await?
            .ok_or_else(|| CoreError::EntityNotFound(id.to_string()))
    }
}

/// Shared table logic behind both store implementations
#[derive(Debug, Default, Clone)]
struct EntityTable {
    entities: BTreeMap<String, Entity>,
}

impl EntityTable {
    fn insert(&mut self, entity: Entity) -> Result<()> {
        if self.entities.contains_key(&entity.id) {
            return Err(CoreError::EntityAlreadyExists(entity.id));
        }
        self.entities.insert(entity.id.clone(), entity);
        Ok(())
    }

    fn modify(&mut self, id: &str, mutation: EntityMutation<'_>) -> Result<Entity> {
        let current = self
            .entities
            .get(id)
            .ok_or_else(|| CoreError::EntityNotFound(id.to_string()))?;

        let mut updated = current.clone();
        mutation(&mut updated)?;
        if updated.id != id {
            return Err(CoreError::InvalidSpec(format!(
                "entity id is immutable ({} -> {})",
                id, updated.id
            )));
        }

        self.entities.insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    fn remove(&mut self, id: &str) -> Result<Entity> {
        let entity = self
            .entities
            .get(id)
            .ok_or_else(|| CoreError::EntityNotFound(id.to_string()))?;
        if entity.status.phase != Phase::Deleted {
            return Err(CoreError::NotDeleted(id.to_string()));
        }
        self.entities
            .remove(id)
            .ok_or_else(|| CoreError::EntityNotFound(id.to_string()))
    }
}

/// In-process entity store
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    table: RwLock<EntityTable>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self.table.read().await.entities.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Entity>> {
        Ok(self.table.read().await.entities.values().cloned().collect())
    }

    async fn insert(&self, entity: Entity) -> Result<()> {
        self.table.write().await.insert(entity)
    }

    async fn modify(&self, id: &str, mutation: EntityMutation<'_>) -> Result<Entity> {
        self.table.write().await.modify(id, mutation)
    }

    async fn remove(&self, id: &str) -> Result<Entity> {
        self.table.write().await.remove(id)
    }
}

/// Entity store persisted as a JSON snapshot.
///
/// Changes are staged on a copy of the table and only become visible once the
/// snapshot holding them is on disk, so readers never see a state the file
/// does not have.
#[derive(Debug)]
pub struct FileEntityStore {
    table: Mutex<EntityTable>,
    file: StateFile,
}

impl FileEntityStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = StateFile::new(path);
        let entities: BTreeMap<String, Entity> = file.load().await?;
        tracing::info!(
            "Opened entity store {} ({} entities)",
            file.path().display(),
            entities.len()
        );
        Ok(Self {
            table: Mutex::new(EntityTable { entities }),
            file,
        })
    }

    async fn commit<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut EntityTable) -> Result<T> + Send,
        T: Send,
    {
        let mut table = self.table.lock().await;
        let mut staged = table.clone();
        let value = change(&mut staged)?;
        self.file.save(&staged.entities).await?;
        *table = staged;
        Ok(value)
    }
}

#[async_trait]
impl EntityStore for FileEntityStore {
    async fn get(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self.table.lock().await.entities.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Entity>> {
        Ok(self.table.lock().await.entities.values().cloned().collect())
    }

    async fn insert(&self, entity: Entity) -> Result<()> {
        self.commit(move |table| table.insert(entity)).await
    }

    async fn modify(&self, id: &str, mutation: EntityMutation<'_>) -> Result<Entity> {
        self.commit(move |table| table.modify(id, mutation)).await
    }

    async fn remove(&self, id: &str) -> Result<Entity> {
        self.commit(move |table| table.remove(id)).await
    }
}
