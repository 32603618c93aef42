//! Reusable conflict-resolution hooks.
//!
//! Each policy owns one or two tables and decides, row by row, whether the
//! casualty's row can be reassigned to the survivor or collides with a row
//! the survivor already holds. Rows are addressed by their full column
//! contents, so policies work on tables without a surrogate key.

use crate::hooks::MigrationHook;
use crate::{MergeError, MergeResult};
use async_trait::async_trait;
use conclave_ledger::{columns as ledger_columns, MembershipLedger, RoleFlags};
use conclave_storage::{Filter, Row, Transaction, Value};
use conclave_types::{Identity, IdentityId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Filter matching exactly the rows whose every column equals `row`.
fn exact_row(row: &Row) -> Filter {
    row.columns().fold(Filter::all(), |filter, (column, value)| {
        if value.is_null() {
            filter.is_null(column.clone())
        } else {
            filter.eq(column.clone(), value.clone())
        }
    })
}

/// Rows of `table` held by the survivor that agree with `row` on `counterparts`.
async fn survivor_equivalent(
    tx: &mut dyn Transaction,
    table: &str,
    identity_column: &str,
    counterparts: &[String],
    row: &Row,
    survivor: IdentityId,
) -> MergeResult<Option<Row>> {
    let mut filter = Filter::by(identity_column, survivor.get());
    for column in counterparts {
        let value = row.value(column);
        filter = if value.is_null() {
            filter.is_null(column.clone())
        } else {
            filter.eq(column.clone(), value.clone())
        };
    }
    Ok(tx.select(table, &filter).await?.into_iter().next())
}

async fn reassign(
    tx: &mut dyn Transaction,
    table: &str,
    identity_column: &str,
    row: &Row,
    survivor: IdentityId,
) -> MergeResult<()> {
    let changes = Row::new().with(identity_column, survivor.get());
    tx.update(table, &exact_row(row), &changes).await?;
    Ok(())
}

async fn rows_of(
    tx: &mut dyn Transaction,
    table: &str,
    identity_column: &str,
    identity: IdentityId,
) -> MergeResult<Vec<Row>> {
    Ok(tx
        .select(table, &Filter::by(identity_column, identity.get()))
        .await?)
}

/// Union of the space-separated tokens held in `column` of both rows.
fn union_tokens(survivor: &Row, casualty: &Row, column: &str) -> String {
    let tokens = |row: &Row| {
        row.text(column)
            .map(|text| text.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .unwrap_or_default()
    };
    tokens(survivor)
        .into_iter()
        .chain(tokens(casualty))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(" ")
}

/// One row per (identity, counterpart), with cumulative token columns.
///
/// When both identities hold a row for the same counterpart, the token
/// columns are unioned into the survivor's row and the casualty's row is
/// removed. Used for grants such as OAuth scopes.
#[derive(Clone, Debug)]
pub struct SingletonMergeHook {
    table: String,
    identity_column: String,
    counterpart_column: String,
    token_columns: Vec<String>,
}

impl SingletonMergeHook {
    pub fn new(
        table: impl Into<String>,
        identity_column: impl Into<String>,
        counterpart_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            identity_column: identity_column.into(),
            counterpart_column: counterpart_column.into(),
            token_columns: Vec::new(),
        }
    }

    pub fn token_column(mut self, column: impl Into<String>) -> Self {
        self.token_columns.push(column.into());
        self
    }
}

#[async_trait]
impl MigrationHook for SingletonMergeHook {
    async fn migrate_identity(
        &self,
        tx: &mut dyn Transaction,
        old: &Identity,
        new: &Identity,
    ) -> MergeResult<BTreeSet<String>> {
        let counterparts = std::slice::from_ref(&self.counterpart_column);
        for row in rows_of(tx, &self.table, &self.identity_column, old.id).await? {
            let existing = survivor_equivalent(
                tx,
                &self.table,
                &self.identity_column,
                counterparts,
                &row,
                new.id,
            )
            .await?;

            match existing {
                Some(survivor_row) => {
                    let changes: Row = self
                        .token_columns
                        .iter()
                        .map(|column| {
                            let merged = union_tokens(&survivor_row, &row, column);
                            (column.clone(), Value::from(merged))
                        })
                        .collect();
                    if !changes.is_empty() {
                        tx.update(&self.table, &exact_row(&survivor_row), &changes)
                            .await?;
                    }
                    tx.delete(&self.table, &exact_row(&row)).await?;
                    debug!(
                        table = %self.table,
                        counterpart = %row.value(&self.counterpart_column),
                        "singleton rows folded into survivor"
                    );
                }
                None => reassign(tx, &self.table, &self.identity_column, &row, new.id).await?,
            }
        }
        Ok(BTreeSet::from([self.table.clone()]))
    }
}

/// Rows unique per (identity, counterpart) where the survivor's row wins.
///
/// The casualty's duplicate is deleted; everything else is reassigned.
#[derive(Clone, Debug)]
pub struct DiscardDuplicateHook {
    table: String,
    identity_column: String,
    counterpart_columns: Vec<String>,
    log_discarded: bool,
}

impl DiscardDuplicateHook {
    pub fn new(table: impl Into<String>, identity_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            identity_column: identity_column.into(),
            counterpart_columns: Vec::new(),
            log_discarded: false,
        }
    }

    pub fn counterpart(mut self, column: impl Into<String>) -> Self {
        self.counterpart_columns.push(column.into());
        self
    }

    pub fn log_discarded(mut self, enabled: bool) -> Self {
        self.log_discarded = enabled;
        self
    }
}

#[async_trait]
impl MigrationHook for DiscardDuplicateHook {
    async fn migrate_identity(
        &self,
        tx: &mut dyn Transaction,
        old: &Identity,
        new: &Identity,
    ) -> MergeResult<BTreeSet<String>> {
        for row in rows_of(tx, &self.table, &self.identity_column, old.id).await? {
            let existing = survivor_equivalent(
                tx,
                &self.table,
                &self.identity_column,
                &self.counterpart_columns,
                &row,
                new.id,
            )
            .await?;

            if existing.is_some() {
                tx.delete(&self.table, &exact_row(&row)).await?;
                if self.log_discarded {
                    let discarded: BTreeMap<_, _> = row
                        .columns()
                        .map(|(column, value)| (column.as_str(), value.to_string()))
                        .collect();
                    info!(
                        table = %self.table,
                        casualty = %old.id,
                        survivor = %new.id,
                        ?discarded,
                        "discarded conflicting row"
                    );
                }
            } else {
                reassign(tx, &self.table, &self.identity_column, &row, new.id).await?;
            }
        }
        Ok(BTreeSet::from([self.table.clone()]))
    }
}

/// Group membership kept in an association table.
///
/// The casualty's memberships move to the survivor, and those duplicating a
/// group the survivor already belongs to are dropped. The owning table's identity column (a group
/// owner, for instance) is repointed when configured.
#[derive(Clone, Debug)]
pub struct SecondaryMembershipHook {
    owning_table: String,
    owner_column: Option<String>,
    association_table: String,
    identity_column: String,
    group_column: String,
}

impl SecondaryMembershipHook {
    pub fn new(
        owning_table: impl Into<String>,
        association_table: impl Into<String>,
        group_column: impl Into<String>,
        identity_column: impl Into<String>,
    ) -> Self {
        Self {
            owning_table: owning_table.into(),
            owner_column: None,
            association_table: association_table.into(),
            identity_column: identity_column.into(),
            group_column: group_column.into(),
        }
    }

    pub fn owner_column(mut self, column: impl Into<String>) -> Self {
        self.owner_column = Some(column.into());
        self
    }
}

#[async_trait]
impl MigrationHook for SecondaryMembershipHook {
    async fn migrate_identity(
        &self,
        tx: &mut dyn Transaction,
        old: &Identity,
        new: &Identity,
    ) -> MergeResult<BTreeSet<String>> {
        let memberships = rows_of(tx, &self.association_table, &self.identity_column, old.id).await?;
        let mut joined = 0usize;

        for row in &memberships {
            let group = row.value(&self.group_column).clone();
            let already_member = tx
                .exists(
                    &self.association_table,
                    &Filter::by(self.group_column.clone(), group)
                        .eq(self.identity_column.clone(), new.id.get()),
                )
                .await?;
            if !already_member {
                // Moved in place, so any surrogate key the row carries is kept.
                reassign(tx, &self.association_table, &self.identity_column, row, new.id).await?;
                joined += 1;
            }
        }

        let left = tx
            .delete(
                &self.association_table,
                &Filter::by(self.identity_column.clone(), old.id.get()),
            )
            .await?;

        if let Some(owner_column) = &self.owner_column {
            tx.update(
                &self.owning_table,
                &Filter::by(owner_column.clone(), old.id.get()),
                &Row::new().with(owner_column.clone(), new.id.get()),
            )
            .await?;
        }

        debug!(
            table = %self.association_table,
            joined,
            left,
            "group memberships moved to survivor"
        );
        Ok(BTreeSet::from([
            self.owning_table.clone(),
            self.association_table.clone(),
        ]))
    }
}

/// Rows where both identities holding one is a genuine domain conflict,
/// such as two tickets for the same event. Any overlap vetoes the merge.
#[derive(Clone, Debug)]
pub struct ConflictVetoHook {
    entity: String,
    table: String,
    identity_column: String,
    counterpart_columns: Vec<String>,
}

impl ConflictVetoHook {
    pub fn new(
        entity: impl Into<String>,
        table: impl Into<String>,
        identity_column: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            table: table.into(),
            identity_column: identity_column.into(),
            counterpart_columns: Vec::new(),
        }
    }

    pub fn counterpart(mut self, column: impl Into<String>) -> Self {
        self.counterpart_columns.push(column.into());
        self
    }
}

#[async_trait]
impl MigrationHook for ConflictVetoHook {
    async fn migrate_identity(
        &self,
        tx: &mut dyn Transaction,
        old: &Identity,
        new: &Identity,
    ) -> MergeResult<BTreeSet<String>> {
        for row in rows_of(tx, &self.table, &self.identity_column, old.id).await? {
            let clash = survivor_equivalent(
                tx,
                &self.table,
                &self.identity_column,
                &self.counterpart_columns,
                &row,
                new.id,
            )
            .await?;
            if clash.is_some() {
                let counterpart = self
                    .counterpart_columns
                    .iter()
                    .map(|column| format!("{column}={}", row.value(column)))
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(MergeError::veto(
                    self.entity.clone(),
                    format!("both identities hold {} rows for {counterpart}", self.table),
                ));
            }
            reassign(tx, &self.table, &self.identity_column, &row, new.id).await?;
        }
        Ok(BTreeSet::from([self.table.clone()]))
    }
}

/// Merges one membership kind through the ledger instead of raw updates.
///
/// Where both identities hold an active row on the same parent, the
/// survivor's row is replaced with the union of both role sets and the
/// casualty's row is revoked. Casualty invites that duplicate something the
/// survivor already has are revoked. Every casualty row, history included,
/// is then repointed to the survivor along with granter and revoker
/// references. No row is deleted.
#[derive(Clone, Debug)]
pub struct LedgerMembershipHook {
    ledger: MembershipLedger,
}

impl LedgerMembershipHook {
    pub fn new(ledger: MembershipLedger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl MigrationHook for LedgerMembershipHook {
    async fn migrate_identity(
        &self,
        tx: &mut dyn Transaction,
        old: &Identity,
        new: &Identity,
    ) -> MergeResult<BTreeSet<String>> {
        let kind = self.ledger.kind();
        let mut folded = 0usize;

        for mut record in self.ledger.for_subject(tx, old.id).await? {
            if record.is_active() {
                let Some(mut survivor) = self.ledger.active(tx, record.parent_id, new.id).await?
                else {
                    continue;
                };
                let union: RoleFlags = kind
                    .role_columns
                    .iter()
                    .map(|role| {
                        let held = record.role(&role.column) || survivor.role(&role.column);
                        (role.column.clone(), held)
                    })
                    .collect();
                self.ledger.replace(tx, &mut survivor, new.id, &union).await?;
                self.ledger.revoke(tx, &mut record, new.id).await?;
                folded += 1;
            } else if record.is_pending_invite() {
                let survivor_has_it = self
                    .ledger
                    .active(tx, record.parent_id, new.id)
                    .await?
                    .is_some()
                    || self
                        .ledger
                        .pending_invite(tx, record.parent_id, new.id)
                        .await?
                        .is_some();
                if survivor_has_it {
                    self.ledger.revoke(tx, &mut record, new.id).await?;
                }
            }
        }

        let mut repointed = 0;
        for column in [
            ledger_columns::SUBJECT,
            ledger_columns::GRANTED_BY,
            ledger_columns::REVOKED_BY,
        ] {
            repointed += tx
                .update(
                    &kind.table,
                    &Filter::by(column, old.id.get()),
                    &Row::new().with(column, new.id.get()),
                )
                .await?;
        }

        info!(
            kind = %kind.name,
            casualty = %old.id,
            survivor = %new.id,
            folded,
            repointed,
            "memberships merged"
        );
        Ok(BTreeSet::from([kind.table.clone()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_storage::memory::InMemoryStore;
    use conclave_storage::{ColumnType, Store, TableDescriptor};
    use conclave_ledger::MembershipKind;
    use conclave_types::{IdentityStatus, RecordType};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn identity(id: i64, age_days: i64) -> Identity {
        Identity {
            id: IdentityId(id),
            public_id: Uuid::new_v4(),
            created_at: Utc::now() - Duration::days(age_days),
            status: IdentityStatus::Active,
        }
    }

    async fn store_with(tables: Vec<TableDescriptor>) -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .create_table(TableDescriptor::new("identity").with_id())
            .await
            .unwrap();
        for table in tables {
            store.create_table(table).await.unwrap();
        }
        let mut tx = store.begin().await.unwrap();
        for _ in 0..3 {
            tx.insert("identity", Row::new()).await.unwrap();
        }
        tx.commit().await.unwrap();
        store
    }

    #[test]
    fn test_union_tokens_is_sorted_and_deduplicated() {
        let a = Row::new().with("scope", "write read");
        let b = Row::new().with("scope", "read  admin");
        assert_eq!(union_tokens(&a, &b, "scope"), "admin read write");
        assert_eq!(union_tokens(&a, &Row::new(), "scope"), "read write");
    }

    #[test]
    fn test_exact_row_handles_nulls() {
        let row = Row::new().with("a", 1).with("b", Value::Null);
        assert!(exact_row(&row).matches(&row));
        assert!(!exact_row(&row).matches(&Row::new().with("a", 1).with("b", 2)));
    }

    #[tokio::test]
    async fn test_conflict_veto_reassigns_until_overlap() {
        let ticket = TableDescriptor::new("ticket_participant")
            .with_id()
            .column("event_id", ColumnType::Int)
            .column("holder_id", ColumnType::Int)
            .references("holder_id", "identity", "id");
        let store = store_with(vec![ticket]).await;
        let (survivor, casualty) = (identity(1, 10), identity(2, 1));
        let hook = ConflictVetoHook::new("ticket", "ticket_participant", "holder_id")
            .counterpart("event_id");

        let mut tx = store.begin().await.unwrap();
        let row = |event: i64, holder: i64| Row::new().with("event_id", event).with("holder_id", holder);
        tx.insert("ticket_participant", row(7, 2)).await.unwrap();
        tx.insert("ticket_participant", row(8, 1)).await.unwrap();

        let handled = hook
            .migrate_identity(tx.as_mut(), &casualty, &survivor)
            .await
            .unwrap();
        assert_eq!(handled, BTreeSet::from(["ticket_participant".to_string()]));
        assert!(tx
            .select("ticket_participant", &Filter::by("holder_id", 2))
            .await
            .unwrap()
            .is_empty());

        tx.insert("ticket_participant", row(7, 3)).await.unwrap();
        let err = hook
            .migrate_identity(tx.as_mut(), &identity(3, 0), &survivor)
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::Veto { ref entity, .. } if entity == "ticket"));
    }

    #[tokio::test]
    async fn test_secondary_membership_keeps_surrogate_keys() {
        let team = TableDescriptor::new("team").with_id();
        let team_member = TableDescriptor::new("team_member")
            .with_id()
            .column("team_id", ColumnType::Int)
            .column("identity_id", ColumnType::Int)
            .references("team_id", "team", "id")
            .references("identity_id", "identity", "id")
            .unique("team_member_key", &["team_id", "identity_id"]);
        let store = store_with(vec![team, team_member]).await;
        let (survivor, casualty) = (identity(1, 10), identity(2, 1));
        let hook = SecondaryMembershipHook::new("team", "team_member", "team_id", "identity_id");

        let mut tx = store.begin().await.unwrap();
        for _ in 0..2 {
            tx.insert("team", Row::new()).await.unwrap();
        }
        let member = |team: i64, identity: &Identity| {
            Row::new().with("team_id", team).with("identity_id", identity.id.get())
        };
        let moved = tx.insert("team_member", member(1, &casualty)).await.unwrap();
        tx.insert("team_member", member(2, &casualty)).await.unwrap();
        let kept = tx.insert("team_member", member(2, &survivor)).await.unwrap();

        hook.migrate_identity(tx.as_mut(), &casualty, &survivor)
            .await
            .unwrap();

        let rows = tx
            .select("team_member", &Filter::by("identity_id", survivor.id.get()))
            .await
            .unwrap();
        let ids: BTreeSet<_> = rows.iter().filter_map(|row| row.int("id")).collect();
        assert_eq!(ids, BTreeSet::from([moved.int("id").unwrap(), kept.int("id").unwrap()]));
        assert!(tx
            .select("team_member", &Filter::by("identity_id", casualty.id.get()))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_ledger_hook_unions_overlapping_grants() {
        let kind = MembershipKind::new("org", "organization_membership", "organization", "organization_id")
            .role("is_owner", "owner")
            .role("is_admin", "admin");
        let store = store_with(vec![
            TableDescriptor::new("organization").with_id(),
        ])
        .await;
        store.create_table(kind.descriptor()).await.unwrap();

        let ledger = MembershipLedger::new(kind);
        let (survivor, casualty) = (identity(1, 10), identity(2, 1));
        let flags = |owner: bool, admin: bool| {
            RoleFlags::from([("is_owner".to_string(), owner), ("is_admin".to_string(), admin)])
        };

        let mut tx = store.begin().await.unwrap();
        for _ in 0..3 {
            tx.insert("organization", Row::new()).await.unwrap();
        }
        // Both hold org 1; only the casualty holds org 2 and an invite to org 3.
        ledger
            .grant(tx.as_mut(), 1, survivor.id, None, RecordType::DirectAdd, &flags(false, true))
            .await
            .unwrap();
        ledger
            .grant(tx.as_mut(), 1, casualty.id, Some(casualty.id), RecordType::DirectAdd, &flags(true, false))
            .await
            .unwrap();
        ledger
            .grant(tx.as_mut(), 2, casualty.id, None, RecordType::DirectAdd, &flags(false, true))
            .await
            .unwrap();
        ledger
            .grant(tx.as_mut(), 3, casualty.id, None, RecordType::Invite, &flags(false, false))
            .await
            .unwrap();
        let rows_before = tx
            .select("organization_membership", &Filter::all())
            .await
            .unwrap()
            .len();

        let hook = LedgerMembershipHook::new(ledger.clone());
        hook.migrate_identity(tx.as_mut(), &casualty, &survivor)
            .await
            .unwrap();

        let merged = ledger.active(tx.as_mut(), 1, survivor.id).await.unwrap().unwrap();
        assert_eq!(merged.roles, flags(true, true));
        assert_eq!(merged.record_type, RecordType::Amend);
        assert!(ledger.active(tx.as_mut(), 2, survivor.id).await.unwrap().is_some());
        assert!(ledger
            .pending_invite(tx.as_mut(), 3, survivor.id)
            .await
            .unwrap()
            .is_some());

        assert!(ledger.for_subject(tx.as_mut(), casualty.id).await.unwrap().is_empty());
        assert!(tx
            .select("organization_membership", &Filter::by("granted_by_id", casualty.id.get()))
            .await
            .unwrap()
            .is_empty());

        let rows_after = tx
            .select("organization_membership", &Filter::all())
            .await
            .unwrap()
            .len();
        assert_eq!(rows_after, rows_before + 1);
    }
}
