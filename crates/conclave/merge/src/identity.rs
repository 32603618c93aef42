//! Identity and tombstone rows as the merge sees them.

use crate::{MergeConfig, MergeError, MergeResult};
use chrono::{DateTime, Utc};
use conclave_storage::{ColumnType, Filter, Row, StorageError, TableDescriptor, Transaction};
use conclave_types::{Identity, IdentityId, IdentityStatus, Tombstone};
use uuid::Uuid;

pub mod columns {
    pub const PUBLIC_ID: &str = "public_id";
    pub const CREATED_AT: &str = "created_at";
    pub const STATUS: &str = "status";

    pub const RETIRED_PUBLIC_ID: &str = "retired_public_id";
    pub const SURVIVOR_ID: &str = "survivor_id";
    pub const MERGED_AT: &str = "merged_at";
}

pub fn identity_descriptor(config: &MergeConfig) -> TableDescriptor {
    TableDescriptor::new(config.identity_table.clone())
        .column(config.identity_key.clone(), ColumnType::Int)
        .primary_key(&[config.identity_key.as_str()])
        .column(columns::PUBLIC_ID, ColumnType::Text)
        .column(columns::CREATED_AT, ColumnType::Timestamp)
        .column(columns::STATUS, ColumnType::Text)
        .unique(
            format!("{}_public_id_key", config.identity_table),
            &[columns::PUBLIC_ID],
        )
}

/// The tombstone table references its survivor but is never walked by merges:
/// earlier tombstones keep pointing at the identity they resolved to.
pub fn tombstone_descriptor(config: &MergeConfig) -> TableDescriptor {
    TableDescriptor::new(config.tombstone_table.clone())
        .with_id()
        .column(columns::RETIRED_PUBLIC_ID, ColumnType::Text)
        .column(columns::SURVIVOR_ID, ColumnType::Int)
        .column(columns::MERGED_AT, ColumnType::Timestamp)
        .references(
            columns::SURVIVOR_ID,
            config.identity_table.clone(),
            config.identity_key.clone(),
        )
        .unique(
            format!("{}_retired_key", config.tombstone_table),
            &[columns::RETIRED_PUBLIC_ID],
        )
}

pub async fn create_identity(
    tx: &mut dyn Transaction,
    config: &MergeConfig,
    created_at: DateTime<Utc>,
) -> MergeResult<Identity> {
    let row = Row::new()
        .with(columns::PUBLIC_ID, Uuid::new_v4().to_string())
        .with(columns::CREATED_AT, created_at)
        .with(columns::STATUS, IdentityStatus::Active.as_str());
    let stored = tx.insert(&config.identity_table, row).await?;
    identity_from_row(config, &stored)
}

pub async fn load_identity(
    tx: &mut dyn Transaction,
    config: &MergeConfig,
    id: IdentityId,
) -> MergeResult<Option<Identity>> {
    let filter = Filter::by(config.identity_key.clone(), id.get());
    tx.select_one(&config.identity_table, &filter)
        .await?
        .map(|row| identity_from_row(config, &row))
        .transpose()
}

pub async fn find_by_public_id(
    tx: &mut dyn Transaction,
    config: &MergeConfig,
    public_id: Uuid,
) -> MergeResult<Option<Identity>> {
    let filter = Filter::by(columns::PUBLIC_ID, public_id.to_string());
    tx.select_one(&config.identity_table, &filter)
        .await?
        .map(|row| identity_from_row(config, &row))
        .transpose()
}

/// Retire `id`. Only an active identity can be retired.
pub async fn mark_merged(
    tx: &mut dyn Transaction,
    config: &MergeConfig,
    id: IdentityId,
) -> MergeResult<()> {
    let filter = Filter::by(config.identity_key.clone(), id.get())
        .eq(columns::STATUS, IdentityStatus::Active.as_str());
    let changes = Row::new().with(columns::STATUS, IdentityStatus::Merged.as_str());
    match tx.update(&config.identity_table, &filter, &changes).await? {
        0 => Err(MergeError::AlreadyMerged(id)),
        _ => Ok(()),
    }
}

pub(crate) async fn insert_tombstone(
    tx: &mut dyn Transaction,
    config: &MergeConfig,
    tombstone: &Tombstone,
) -> MergeResult<()> {
    let row = Row::new()
        .with(columns::RETIRED_PUBLIC_ID, tombstone.retired_public_id.to_string())
        .with(columns::SURVIVOR_ID, tombstone.survivor_id.get())
        .with(columns::MERGED_AT, tombstone.merged_at);
    tx.insert(&config.tombstone_table, row).await?;
    Ok(())
}

pub(crate) async fn load_tombstone(
    tx: &mut dyn Transaction,
    config: &MergeConfig,
    retired: Uuid,
) -> MergeResult<Option<Tombstone>> {
    let filter = Filter::by(columns::RETIRED_PUBLIC_ID, retired.to_string());
    let Some(row) = tx.select_one(&config.tombstone_table, &filter).await? else {
        return Ok(None);
    };
    let survivor_id = row
        .int(columns::SURVIVOR_ID)
        .ok_or_else(|| corrupt(&config.tombstone_table, columns::SURVIVOR_ID))?;
    let merged_at = row
        .timestamp(columns::MERGED_AT)
        .ok_or_else(|| corrupt(&config.tombstone_table, columns::MERGED_AT))?;
    Ok(Some(Tombstone {
        retired_public_id: retired,
        survivor_id: IdentityId(survivor_id),
        merged_at,
    }))
}

fn identity_from_row(config: &MergeConfig, row: &Row) -> MergeResult<Identity> {
    let table = config.identity_table.as_str();
    let id = row
        .int(&config.identity_key)
        .ok_or_else(|| corrupt(table, &config.identity_key))?;
    let public_id = row
        .text(columns::PUBLIC_ID)
        .and_then(|text| Uuid::parse_str(text).ok())
        .ok_or_else(|| corrupt(table, columns::PUBLIC_ID))?;
    let created_at = row
        .timestamp(columns::CREATED_AT)
        .ok_or_else(|| corrupt(table, columns::CREATED_AT))?;
    let status = row
        .text(columns::STATUS)
        .and_then(|text| text.parse::<IdentityStatus>().ok())
        .ok_or_else(|| corrupt(table, columns::STATUS))?;

    Ok(Identity {
        id: IdentityId(id),
        public_id,
        created_at,
        status,
    })
}

fn corrupt(table: &str, column: &str) -> MergeError {
    MergeError::Storage(StorageError::Serialization(format!(
        "{table} row has no valid {column}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_storage::memory::InMemoryStore;
    use conclave_storage::Store;

    async fn store(config: &MergeConfig) -> InMemoryStore {
        let store = InMemoryStore::new();
        store.create_table(identity_descriptor(config)).await.unwrap();
        store.create_table(tombstone_descriptor(config)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_identity_round_trip_through_store() {
        let config = MergeConfig::default();
        let store = store(&config).await;
        let mut tx = store.begin().await.unwrap();

        let created = create_identity(tx.as_mut(), &config, Utc::now()).await.unwrap();
        assert!(created.is_active());

        let loaded = load_identity(tx.as_mut(), &config, created.id).await.unwrap();
        assert_eq!(loaded, Some(created.clone()));

        let by_public = find_by_public_id(tx.as_mut(), &config, created.public_id)
            .await
            .unwrap();
        assert_eq!(by_public, Some(created));
        assert_eq!(
            load_identity(tx.as_mut(), &config, IdentityId(99)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_mark_merged_only_once() {
        let config = MergeConfig::default();
        let store = store(&config).await;
        let mut tx = store.begin().await.unwrap();

        let identity = create_identity(tx.as_mut(), &config, Utc::now()).await.unwrap();
        mark_merged(tx.as_mut(), &config, identity.id).await.unwrap();

        let reloaded = load_identity(tx.as_mut(), &config, identity.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, IdentityStatus::Merged);
        assert!(matches!(
            mark_merged(tx.as_mut(), &config, identity.id).await,
            Err(MergeError::AlreadyMerged(_))
        ));
    }

    #[tokio::test]
    async fn test_tombstone_is_unique_per_retired_identity() {
        let config = MergeConfig::default();
        let store = store(&config).await;
        let mut tx = store.begin().await.unwrap();

        let survivor = create_identity(tx.as_mut(), &config, Utc::now()).await.unwrap();
        let tombstone = Tombstone {
            retired_public_id: Uuid::new_v4(),
            survivor_id: survivor.id,
            merged_at: Utc::now(),
        };
        insert_tombstone(tx.as_mut(), &config, &tombstone).await.unwrap();

        let loaded = load_tombstone(tx.as_mut(), &config, tombstone.retired_public_id)
            .await
            .unwrap();
        assert_eq!(loaded, Some(tombstone.clone()));
        assert!(insert_tombstone(tx.as_mut(), &config, &tombstone).await.is_err());
    }
}
