//! Identity merge coordinator.
//!
//! A merge runs as one storage transaction:
//! 1. load both identities and pick the survivor (the older one)
//! 2. run every registered entity in name order, through its hook if it has
//!    one, else through the generic migrator over its declared tables
//! 3. run the generic migrator over every remaining catalog table
//! 4. retire the casualty and write its tombstone
//! 5. commit
//!
//! Any veto or unsafe table rolls the transaction back and the merge reports
//! itself aborted. Nothing is visible to other transactions until commit.

use crate::hooks::HookRegistry;
use crate::identity::{load_identity, mark_merged};
use crate::migrator::{GenericTableMigrator, TableMigration, UnsafeReason};
use crate::tombstone::{resolve_public_id, write_tombstone};
use crate::{MergeConfig, MergeError, MergeResult};
use conclave_storage::{SchemaCatalog, Store, Transaction};
use conclave_types::{Identity, IdentityId, Tombstone};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a committed merge did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub survivor: Identity,
    pub casualty: Identity,
    pub tombstone: Tombstone,
    /// Tables each hooked entity reported handled.
    pub hooked: BTreeMap<String, BTreeSet<String>>,
    /// Outcome per table walked by the generic migrator. Tables without an
    /// identity reference are omitted.
    pub tables: BTreeMap<String, TableMigration>,
}

impl MergeReport {
    pub fn migrated_rows(&self) -> u64 {
        self.tables
            .values()
            .map(|outcome| match outcome {
                TableMigration::Migrated { rows } => *rows,
                _ => 0,
            })
            .sum()
    }
}

/// Why a merge rolled back.
///
/// `Display` is the message for end users and never names the blocking
/// table; `Debug` carries the detail for logs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AbortReason {
    Veto { entity: String, reason: String },
    UnsafeTable { table: String, reason: UnsafeReason },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the account merge could not be completed")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum MergeOutcome {
    Merged(MergeReport),
    Aborted { reason: AbortReason },
}

impl MergeOutcome {
    pub fn survivor(&self) -> Option<&Identity> {
        match self {
            MergeOutcome::Merged(report) => Some(&report.survivor),
            MergeOutcome::Aborted { .. } => None,
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, MergeOutcome::Merged(_))
    }
}

enum Walk {
    Done(MergeReport),
    Abort(AbortReason),
}

pub struct MergeCoordinator {
    store: Arc<dyn Store>,
    registry: HookRegistry,
    config: MergeConfig,
    migrator: GenericTableMigrator,
}

impl MergeCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        registry: HookRegistry,
        config: MergeConfig,
    ) -> MergeResult<Self> {
        config.validate()?;
        Ok(Self {
            migrator: GenericTableMigrator::new(&config),
            store,
            registry,
            config,
        })
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// Merge two identities, returning the survivor, or `None` when the merge
    /// was vetoed or blocked by an unsafe table.
    pub async fn merge_identities(
        &self,
        a: IdentityId,
        b: IdentityId,
    ) -> MergeResult<Option<Identity>> {
        Ok(self.merge(a, b).await?.survivor().cloned())
    }

    /// Merge two identities and report what happened.
    ///
    /// Errors are reserved for requests that are wrong on their face (self
    /// merge, unknown or retired identity), misconfiguration and storage
    /// failures. Every error after the transaction opened rolls it back.
    pub async fn merge(&self, a: IdentityId, b: IdentityId) -> MergeResult<MergeOutcome> {
        if a == b {
            return Err(MergeError::SelfMerge(a));
        }

        let catalog = self.store.catalog().await?;
        if let Some(missing) = self
            .registry
            .declared_tables()
            .into_iter()
            .find(|table| catalog.get(table).is_none())
        {
            return Err(MergeError::UnknownTable(missing.to_string()));
        }

        let mut tx = self.store.begin().await?;
        let walked = self.walk(tx.as_mut(), &catalog, a, b).await;

        let reason = match walked {
            Ok(Walk::Done(report)) => {
                tx.commit().await?;
                info!(
                    survivor = %report.survivor.id,
                    casualty = %report.casualty.id,
                    rows = report.migrated_rows(),
                    hooked = report.hooked.len(),
                    "identities merged"
                );
                return Ok(MergeOutcome::Merged(report));
            }
            Ok(Walk::Abort(reason)) => reason,
            Err(MergeError::Veto { entity, reason }) => AbortReason::Veto { entity, reason },
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed merge also failed");
                }
                return Err(err);
            }
        };

        tx.rollback().await?;
        warn!(a = %a, b = %b, reason = ?reason, "identity merge aborted");
        Ok(MergeOutcome::Aborted { reason })
    }

    /// Follow tombstones from `public_id` to the identity it names today.
    pub async fn resolve_public_id(&self, public_id: Uuid) -> MergeResult<Option<Identity>> {
        let mut tx = self.store.begin().await?;
        let resolved = resolve_public_id(tx.as_mut(), &self.config, public_id).await;
        tx.rollback().await?;
        resolved
    }

    async fn walk(
        &self,
        tx: &mut dyn Transaction,
        catalog: &SchemaCatalog,
        a: IdentityId,
        b: IdentityId,
    ) -> MergeResult<Walk> {
        let first = self.load_active(tx, a).await?;
        let second = self.load_active(tx, b).await?;
        let (survivor, casualty) = if first.is_older_than(&second) {
            (first, second)
        } else {
            (second, first)
        };
        info!(survivor = %survivor.id, casualty = %casualty.id, "merging identities");

        let mut handled: BTreeSet<String> = BTreeSet::new();
        let mut hooked = BTreeMap::new();
        let mut tables = BTreeMap::new();

        for registration in self.registry.iter() {
            match registration.hook() {
                Some(hook) => {
                    debug!(entity = registration.entity(), "running migration hook");
                    let mut claimed = hook.migrate_identity(tx, &casualty, &survivor).await?;
                    claimed.insert(registration.primary_table().to_string());
                    handled.extend(claimed.iter().cloned());
                    hooked.insert(registration.entity().to_string(), claimed);
                }
                None => {
                    for table in registration.tables() {
                        if handled.contains(table) || self.config.is_reserved(table) {
                            continue;
                        }
                        let Some(descriptor) = catalog.get(table) else {
                            return Err(MergeError::UnknownTable(table.clone()));
                        };
                        let outcome = self
                            .migrator
                            .migrate(tx, descriptor, casualty.id, survivor.id)
                            .await?;
                        if let TableMigration::Unsafe(reason) = outcome {
                            return Ok(Walk::Abort(AbortReason::UnsafeTable {
                                table: table.clone(),
                                reason,
                            }));
                        }
                        handled.insert(table.clone());
                        if outcome != TableMigration::NotReferenced {
                            tables.insert(table.clone(), outcome);
                        }
                    }
                }
            }
        }

        for descriptor in catalog.tables() {
            if handled.contains(&descriptor.name) || self.config.is_reserved(&descriptor.name) {
                continue;
            }
            let outcome = self
                .migrator
                .migrate(tx, descriptor, casualty.id, survivor.id)
                .await?;
            match outcome {
                TableMigration::NotReferenced => {}
                TableMigration::Unsafe(reason) => {
                    return Ok(Walk::Abort(AbortReason::UnsafeTable {
                        table: descriptor.name.clone(),
                        reason,
                    }));
                }
                migrated => {
                    tables.insert(descriptor.name.clone(), migrated);
                }
            }
        }

        mark_merged(tx, &self.config, casualty.id).await?;
        let tombstone = write_tombstone(tx, &self.config, &casualty, &survivor).await?;

        Ok(Walk::Done(MergeReport {
            survivor,
            casualty,
            tombstone,
            hooked,
            tables,
        }))
    }

    async fn load_active(&self, tx: &mut dyn Transaction, id: IdentityId) -> MergeResult<Identity> {
        let identity = load_identity(tx, &self.config, id)
            .await?
            .ok_or(MergeError::IdentityNotFound(id))?;
        if !identity.is_active() {
            return Err(MergeError::AlreadyMerged(id));
        }
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{EntityRegistration, MigrationHook};
    use crate::identity::{create_identity, identity_descriptor, tombstone_descriptor};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use conclave_storage::memory::InMemoryStore;
    use conclave_storage::{ColumnType, Filter, Row, TableDescriptor};
    use conclave_types::IdentityStatus;

    struct AlwaysVeto;

    #[async_trait]
    impl MigrationHook for AlwaysVeto {
        async fn migrate_identity(
            &self,
            tx: &mut dyn Transaction,
            old: &Identity,
            new: &Identity,
        ) -> MergeResult<BTreeSet<String>> {
            // Write first so the rollback has something to undo.
            tx.update(
                "note",
                &Filter::by("author_id", old.id.get()),
                &Row::new().with("author_id", new.id.get()),
            )
            .await?;
            Err(MergeError::veto("note", "notes are personal"))
        }
    }

    fn note() -> TableDescriptor {
        TableDescriptor::new("note")
            .with_id()
            .column("author_id", ColumnType::Int)
            .references("author_id", "identity", "id")
    }

    async fn setup() -> (InMemoryStore, Identity, Identity) {
        let config = MergeConfig::default();
        let store = InMemoryStore::new();
        store.create_table(identity_descriptor(&config)).await.unwrap();
        store.create_table(tombstone_descriptor(&config)).await.unwrap();
        store.create_table(note()).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let newer = create_identity(tx.as_mut(), &config, Utc::now()).await.unwrap();
        let older = create_identity(tx.as_mut(), &config, Utc::now() - Duration::days(30))
            .await
            .unwrap();
        for author in [newer.id, newer.id, older.id] {
            tx.insert("note", Row::new().with("author_id", author.get()))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();
        (store, older, newer)
    }

    fn coordinator(store: &InMemoryStore, registry: HookRegistry) -> MergeCoordinator {
        MergeCoordinator::new(Arc::new(store.clone()), registry, MergeConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_older_identity_survives_and_casualty_is_retired() {
        let (store, older, newer) = setup().await;
        let coordinator = coordinator(&store, HookRegistry::new());

        let outcome = coordinator.merge(newer.id, older.id).await.unwrap();
        let MergeOutcome::Merged(report) = outcome else {
            panic!("merge aborted");
        };
        assert_eq!(report.survivor.id, older.id);
        assert_eq!(report.casualty.id, newer.id);
        assert_eq!(report.migrated_rows(), 2);
        assert_eq!(report.tombstone.retired_public_id, newer.public_id);

        let notes = store.rows("note").await.unwrap();
        assert!(notes.iter().all(|row| row.int("author_id") == Some(older.id.get())));

        let resolved = coordinator
            .resolve_public_id(newer.public_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, older.id);

        let identities = store.rows("identity").await.unwrap();
        let retired = identities
            .iter()
            .find(|row| row.int("id") == Some(newer.id.get()))
            .unwrap();
        assert_eq!(retired.text("status"), Some(IdentityStatus::Merged.as_str()));

        assert!(matches!(
            coordinator.merge(older.id, newer.id).await,
            Err(MergeError::AlreadyMerged(id)) if id == newer.id
        ));
    }

    #[tokio::test]
    async fn test_veto_rolls_back_hook_writes() {
        let (store, older, newer) = setup().await;
        let registry = HookRegistry::new()
            .with(EntityRegistration::new("note", "note").with_hook(AlwaysVeto))
            .unwrap();
        let coordinator = coordinator(&store, registry);
        let before = store.snapshot().await;

        let outcome = coordinator.merge(older.id, newer.id).await.unwrap();
        assert!(matches!(
            outcome,
            MergeOutcome::Aborted {
                reason: AbortReason::Veto { ref entity, .. }
            } if entity == "note"
        ));
        assert_eq!(
            outcome_message(&outcome),
            "the account merge could not be completed"
        );
        assert_eq!(store.snapshot().await, before);
        assert_eq!(
            coordinator.merge_identities(older.id, newer.id).await.unwrap(),
            None
        );
    }

    fn outcome_message(outcome: &MergeOutcome) -> String {
        match outcome {
            MergeOutcome::Aborted { reason } => reason.to_string(),
            MergeOutcome::Merged(_) => String::new(),
        }
    }

    #[tokio::test]
    async fn test_requests_are_checked_before_writing() {
        let (store, older, _) = setup().await;
        let coordinator = coordinator(&store, HookRegistry::new());
        let commits = store.commit_count().await;

        assert!(matches!(
            coordinator.merge(older.id, older.id).await,
            Err(MergeError::SelfMerge(_))
        ));
        assert!(matches!(
            coordinator.merge(older.id, IdentityId(404)).await,
            Err(MergeError::IdentityNotFound(IdentityId(404)))
        ));
        assert_eq!(store.commit_count().await, commits);
    }

    #[tokio::test]
    async fn test_registration_of_unknown_table_fails_fast() {
        let (store, older, newer) = setup().await;
        let registry = HookRegistry::new()
            .with(EntityRegistration::new("badge", "badge"))
            .unwrap();
        let coordinator = coordinator(&store, registry);
        assert!(matches!(
            coordinator.merge(older.id, newer.id).await,
            Err(MergeError::UnknownTable(table)) if table == "badge"
        ));
    }

    #[tokio::test]
    async fn test_excluded_tables_keep_their_references() {
        let (store, older, newer) = setup().await;
        let config = MergeConfig::default().exclude("note");
        let coordinator =
            MergeCoordinator::new(Arc::new(store.clone()), HookRegistry::new(), config).unwrap();

        let survivor = coordinator
            .merge_identities(older.id, newer.id)
            .await
            .unwrap();
        assert_eq!(survivor.map(|i| i.id), Some(older.id));

        let still_casualty = store
            .rows("note")
            .await
            .unwrap()
            .iter()
            .filter(|row| row.int("author_id") == Some(newer.id.get()))
            .count();
        assert_eq!(still_casualty, 2);
    }
}
