//! Generic foreign-key repointing for tables without a migration hook.

use crate::{MergeConfig, MergeResult};
use conclave_storage::{Filter, Row, TableDescriptor, Transaction};
use conclave_types::IdentityId;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Why a table could not be migrated generically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum UnsafeReason {
    /// Repointing could collide with a row the survivor already holds.
    UniqueColumn { column: String, constraint: String },
    /// The table lives outside the partition the merge transaction covers.
    ForeignPartition { partition: String },
}

impl fmt::Display for UnsafeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsafeReason::UniqueColumn { column, constraint } => {
                write!(f, "column {column} is covered by {constraint}")
            }
            UnsafeReason::ForeignPartition { partition } => {
                write!(f, "table is hosted on partition {partition}")
            }
        }
    }
}

/// Result of running the generic migrator over one table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TableMigration {
    /// No column of the table references the identity key.
    NotReferenced,
    Migrated { rows: u64 },
    /// The table was left untouched.
    Unsafe(UnsafeReason),
}

impl TableMigration {
    pub fn is_safe(&self) -> bool {
        !matches!(self, TableMigration::Unsafe(_))
    }
}

/// Repoints every identity foreign key of a table from one identity to another,
/// or declines when doing so could violate uniqueness or atomicity.
#[derive(Clone, Debug)]
pub struct GenericTableMigrator {
    identity_table: String,
    identity_key: String,
}

impl GenericTableMigrator {
    pub fn new(config: &MergeConfig) -> Self {
        Self {
            identity_table: config.identity_table.clone(),
            identity_key: config.identity_key.clone(),
        }
    }

    /// Identity foreign-key columns of `descriptor`, in declaration order.
    pub fn identity_columns<'a>(&'a self, descriptor: &'a TableDescriptor) -> Vec<&'a str> {
        descriptor
            .foreign_keys_to(&self.identity_table, &self.identity_key)
            .map(|fk| fk.column.as_str())
            .collect()
    }

    /// Decide, without touching data, whether `descriptor` can be migrated
    /// inside a transaction on `partition`.
    pub fn assess(&self, descriptor: &TableDescriptor, partition: &str) -> Option<UnsafeReason> {
        let columns = self.identity_columns(descriptor);
        if columns.is_empty() {
            return None;
        }
        if descriptor.partition != partition {
            return Some(UnsafeReason::ForeignPartition {
                partition: descriptor.partition.clone(),
            });
        }
        columns.into_iter().find_map(|column| {
            descriptor
                .uniqueness_covering(column)
                .map(|constraint| UnsafeReason::UniqueColumn {
                    column: column.to_string(),
                    constraint: constraint.to_string(),
                })
        })
    }

    pub async fn migrate(
        &self,
        tx: &mut dyn Transaction,
        descriptor: &TableDescriptor,
        old: IdentityId,
        new: IdentityId,
    ) -> MergeResult<TableMigration> {
        let columns = self.identity_columns(descriptor);
        if columns.is_empty() {
            return Ok(TableMigration::NotReferenced);
        }
        if let Some(reason) = self.assess(descriptor, tx.partition()) {
            warn!(table = %descriptor.name, %reason, "table cannot be migrated generically");
            return Ok(TableMigration::Unsafe(reason));
        }

        let mut rows = 0;
        for column in columns {
            let filter = Filter::by(column, old.get());
            let changes = Row::new().with(column, new.get());
            rows += tx.update(&descriptor.name, &filter, &changes).await?;
        }
        debug!(table = %descriptor.name, rows, "table migrated");
        Ok(TableMigration::Migrated { rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::identity_descriptor;
    use chrono::Utc;
    use conclave_storage::memory::InMemoryStore;
    use conclave_storage::{ColumnType, Store, PRIMARY_KEY_CONSTRAINT};

    fn migrator() -> GenericTableMigrator {
        GenericTableMigrator::new(&MergeConfig::default())
    }

    fn comment() -> TableDescriptor {
        TableDescriptor::new("comment")
            .with_id()
            .column("author_id", ColumnType::Int)
            .nullable("edited_by_id", ColumnType::Int)
            .column("body", ColumnType::Text)
            .references("author_id", "identity", "id")
            .references("edited_by_id", "identity", "id")
    }

    fn profile() -> TableDescriptor {
        TableDescriptor::new("profile")
            .with_id()
            .column("identity_id", ColumnType::Int)
            .references("identity_id", "identity", "id")
            .unique("profile_identity_key", &["identity_id"])
    }

    #[test]
    fn test_assess_flags_uniqueness_and_partition() {
        let migrator = migrator();
        assert_eq!(migrator.assess(&comment(), "primary"), None);
        assert_eq!(
            migrator.assess(&profile(), "primary"),
            Some(UnsafeReason::UniqueColumn {
                column: "identity_id".into(),
                constraint: "profile_identity_key".into(),
            })
        );
        assert_eq!(
            migrator.assess(&comment().in_partition("archive"), "primary"),
            Some(UnsafeReason::ForeignPartition {
                partition: "archive".into()
            })
        );

        let keyed_by_identity = TableDescriptor::new("preferences")
            .column("identity_id", ColumnType::Int)
            .primary_key(&["identity_id"])
            .references("identity_id", "identity", "id");
        assert!(matches!(
            migrator.assess(&keyed_by_identity, "primary"),
            Some(UnsafeReason::UniqueColumn { constraint, .. }) if constraint == PRIMARY_KEY_CONSTRAINT
        ));
    }

    #[test]
    fn test_partial_unique_constraint_is_unsafe() {
        let table = TableDescriptor::new("badge")
            .with_id()
            .column("holder_id", ColumnType::Int)
            .column("active", ColumnType::Bool)
            .references("holder_id", "identity", "id")
            .unique_where(
                "badge_active_key",
                &["holder_id"],
                Filter::by("active", true),
            );
        assert!(migrator().assess(&table, "primary").is_some());
    }

    #[tokio::test]
    async fn test_migrate_repoints_every_identity_column() {
        let config = MergeConfig::default();
        let store = InMemoryStore::new();
        store.create_table(identity_descriptor(&config)).await.unwrap();
        store.create_table(comment()).await.unwrap();
        store.create_table(profile()).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..2 {
            let row = Row::new()
                .with("public_id", uuid::Uuid::new_v4().to_string())
                .with("created_at", Utc::now())
                .with("status", "active");
            ids.push(IdentityId(tx.insert("identity", row).await.unwrap().int("id").unwrap()));
        }
        let (old, new) = (ids[0], ids[1]);

        let comment_row = |author: IdentityId, editor: Option<IdentityId>| {
            Row::new()
                .with("author_id", author.get())
                .with("edited_by_id", editor.map(IdentityId::get))
                .with("body", "hello")
        };
        tx.insert("comment", comment_row(old, Some(old))).await.unwrap();
        tx.insert("comment", comment_row(new, Some(old))).await.unwrap();
        tx.insert("comment", comment_row(new, None)).await.unwrap();
        tx.insert("profile", Row::new().with("identity_id", old.get()))
            .await
            .unwrap();

        let outcome = migrator()
            .migrate(tx.as_mut(), &comment(), old, new)
            .await
            .unwrap();
        assert_eq!(outcome, TableMigration::Migrated { rows: 3 });

        let leftovers = tx
            .select("comment", &Filter::by("edited_by_id", old.get()))
            .await
            .unwrap();
        assert!(leftovers.is_empty());

        let outcome = migrator()
            .migrate(tx.as_mut(), &profile(), old, new)
            .await
            .unwrap();
        assert!(!outcome.is_safe());
        let untouched = tx
            .select("profile", &Filter::by("identity_id", old.get()))
            .await
            .unwrap();
        assert_eq!(untouched.len(), 1);

        let unrelated = TableDescriptor::new("venue").with_id();
        assert_eq!(
            migrator()
                .migrate(tx.as_mut(), &unrelated, old, new)
                .await
                .unwrap(),
            TableMigration::NotReferenced
        );
    }
}
