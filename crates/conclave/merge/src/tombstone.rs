//! Tombstones map a retired identity's public id to the identity that absorbed
//! it. Merges only ever write them; callers follow chains through
//! [`resolve_public_id`].

use crate::identity::{find_by_public_id, insert_tombstone, load_identity, load_tombstone};
use crate::{MergeConfig, MergeError, MergeResult};
use chrono::Utc;
use conclave_storage::{StorageError, Transaction};
use conclave_types::{Identity, Tombstone};
use tracing::debug;
use uuid::Uuid;

pub(crate) async fn write_tombstone(
    tx: &mut dyn Transaction,
    config: &MergeConfig,
    casualty: &Identity,
    survivor: &Identity,
) -> MergeResult<Tombstone> {
    let tombstone = Tombstone {
        retired_public_id: casualty.public_id,
        survivor_id: survivor.id,
        merged_at: Utc::now(),
    };
    insert_tombstone(tx, config, &tombstone).await?;
    Ok(tombstone)
}

/// Tombstones crossed when following `public_id` to a live identity, oldest
/// merge first. Empty when `public_id` was never retired.
pub async fn tombstone_chain(
    tx: &mut dyn Transaction,
    config: &MergeConfig,
    public_id: Uuid,
) -> MergeResult<Vec<Tombstone>> {
    let mut chain = Vec::new();
    let mut current = public_id;

    while let Some(tombstone) = load_tombstone(tx, config, current).await? {
        if chain.len() == config.max_tombstone_depth {
            return Err(MergeError::TombstoneChainTooLong {
                public_id: public_id.to_string(),
                max_depth: config.max_tombstone_depth,
            });
        }
        let survivor = load_identity(tx, config, tombstone.survivor_id)
            .await?
            .ok_or_else(|| {
                MergeError::Storage(StorageError::InvariantViolation(format!(
                    "tombstone for {current} points at missing identity {}",
                    tombstone.survivor_id
                )))
            })?;
        current = survivor.public_id;
        chain.push(tombstone);
    }
    Ok(chain)
}

/// The identity a public id refers to today.
///
/// Live identities resolve to themselves; retired ones follow their tombstone
/// chain. Unknown ids resolve to `None`.
pub async fn resolve_public_id(
    tx: &mut dyn Transaction,
    config: &MergeConfig,
    public_id: Uuid,
) -> MergeResult<Option<Identity>> {
    let chain = tombstone_chain(tx, config, public_id).await?;
    match chain.last() {
        Some(last) => {
            debug!(%public_id, hops = chain.len(), survivor = %last.survivor_id, "resolved through tombstones");
            load_identity(tx, config, last.survivor_id).await
        }
        None => find_by_public_id(tx, config, public_id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{create_identity, identity_descriptor, tombstone_descriptor};
    use conclave_storage::memory::InMemoryStore;
    use conclave_storage::Store;

    async fn store(config: &MergeConfig) -> InMemoryStore {
        let store = InMemoryStore::new();
        store.create_table(identity_descriptor(config)).await.unwrap();
        store.create_table(tombstone_descriptor(config)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_chain_is_followed_to_the_live_identity() {
        let config = MergeConfig::default();
        let store = store(&config).await;
        let mut tx = store.begin().await.unwrap();

        let a = create_identity(tx.as_mut(), &config, Utc::now()).await.unwrap();
        let b = create_identity(tx.as_mut(), &config, Utc::now()).await.unwrap();
        let c = create_identity(tx.as_mut(), &config, Utc::now()).await.unwrap();
        write_tombstone(tx.as_mut(), &config, &c, &b).await.unwrap();
        write_tombstone(tx.as_mut(), &config, &b, &a).await.unwrap();

        let resolved = resolve_public_id(tx.as_mut(), &config, c.public_id)
            .await
            .unwrap();
        assert_eq!(resolved.map(|i| i.id), Some(a.id));

        let chain = tombstone_chain(tx.as_mut(), &config, c.public_id).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].survivor_id, b.id);

        let live = resolve_public_id(tx.as_mut(), &config, a.public_id)
            .await
            .unwrap();
        assert_eq!(live, Some(a));
        assert_eq!(
            resolve_public_id(tx.as_mut(), &config, Uuid::new_v4())
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_chain_longer_than_limit_is_rejected() {
        let config = MergeConfig {
            max_tombstone_depth: 1,
            ..MergeConfig::default()
        };
        let store = store(&config).await;
        let mut tx = store.begin().await.unwrap();

        let a = create_identity(tx.as_mut(), &config, Utc::now()).await.unwrap();
        let b = create_identity(tx.as_mut(), &config, Utc::now()).await.unwrap();
        let c = create_identity(tx.as_mut(), &config, Utc::now()).await.unwrap();
        write_tombstone(tx.as_mut(), &config, &c, &b).await.unwrap();
        write_tombstone(tx.as_mut(), &config, &b, &a).await.unwrap();

        assert!(resolve_public_id(tx.as_mut(), &config, b.public_id)
            .await
            .is_ok());
        assert!(matches!(
            resolve_public_id(tx.as_mut(), &config, c.public_id).await,
            Err(MergeError::TombstoneChainTooLong { max_depth: 1, .. })
        ));
    }
}
