//! Walking the entity hierarchy

use crate::error::Result;
use infraflow_core::{AccessSpec, CoreError, Entity, EntityStore, Phase, ResourceSpec};

/// Account → Network → Kubernetes → Storage
const MAX_DEPTH: usize = 4;

/// Ancestors of `entity`, parent first and root last
pub async fn ancestors(store: &dyn EntityStore, entity: &Entity) -> Result<Vec<Entity>> {
    let mut chain: Vec<Entity> = Vec::new();
    let mut next = entity.parent().map(str::to_string);

    while let Some(id) = next {
        if chain.len() >= MAX_DEPTH {
            return Err(CoreError::InvalidSpec(format!(
                "parent chain of {} is deeper than {}",
                entity.id, MAX_DEPTH
            ))
            .into());
        }
        let parent = store.get(&id).await?.ok_or_else(|| {
            CoreError::ParentNotReady(format!("parent {} of {} does not exist", id, entity.id))
        })?;
        next = parent.parent().map(str::to_string);
        chain.push(parent);
    }

    Ok(chain)
}

/// First ancestor that is not `Active`
pub fn first_inactive(ancestors: &[Entity]) -> Option<&Entity> {
    ancestors.iter().find(|a| a.status.phase != Phase::Active)
}

/// Credentials of the account at the root of the chain
pub fn root_access(entity: &Entity, ancestors: &[Entity]) -> Result<AccessSpec> {
    let root = ancestors.last().unwrap_or(entity);
    match &root.spec.resource {
        ResourceSpec::Account(account) => Ok(account.access.clone()),
        _ => Err(CoreError::InvalidSpec(format!(
            "{} is not rooted in an account ({} is a {})",
            entity.id,
            root.id,
            root.kind()
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{account, network, storage};
    use infraflow_core::MemoryEntityStore;

    #[tokio::test]
    async fn test_ancestors_parent_first() {
        let store = MemoryEntityStore::new();
        store.insert(account("acct")).await.unwrap();
        store.insert(network("net", "acct")).await.unwrap();
        let volume = storage("vol", "net");

        let chain = ancestors(&store, &volume).await.unwrap();
        let ids: Vec<&str> = chain.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["net", "acct"]);
        assert_eq!(first_inactive(&chain).map(|e| e.id.as_str()), Some("net"));
        assert!(matches!(
            root_access(&volume, &chain).unwrap(),
            AccessSpec::Aws { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_parent() {
        let store = MemoryEntityStore::new();
        let err = ancestors(&store, &network("net", "ghost")).await.unwrap_err();
        assert_eq!(err.kind(), infraflow_core::ErrorKind::ParentNotReady);
    }

    #[test]
    fn test_root_must_be_an_account() {
        let orphan = network("net", "acct");
        assert!(root_access(&orphan, &[]).is_err());
    }
}
