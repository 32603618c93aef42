use crate::kind::{columns, MembershipKind};
use crate::record::{MembershipRecord, RoleFlags};
use crate::{LedgerError, LedgerResult};
use chrono::{DateTime, Utc};
use conclave_storage::{Filter, Row, Transaction, Value};
use conclave_types::{IdentityId, RecordType};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// State machine over the rows of one membership kind.
///
/// Every operation runs inside the caller's transaction and touches only the
/// kind's own table.
#[derive(Clone, Debug)]
pub struct MembershipLedger {
    kind: Arc<MembershipKind>,
}

impl MembershipLedger {
    pub fn new(kind: MembershipKind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    pub fn from_shared(kind: Arc<MembershipKind>) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> &MembershipKind {
        &self.kind
    }

    /// Create the first row of a membership, either a direct grant or an invite.
    pub async fn grant(
        &self,
        tx: &mut dyn Transaction,
        parent_id: i64,
        subject: IdentityId,
        actor: Option<IdentityId>,
        record_type: RecordType,
        roles: &RoleFlags,
    ) -> LedgerResult<MembershipRecord> {
        if !record_type.is_initial() {
            return Err(LedgerError::InvalidRecordType {
                operation: "grant",
                record_type,
            });
        }
        self.check_fields(roles)?;

        let record = MembershipRecord {
            id: 0,
            parent_id,
            subject,
            granted_at: Utc::now(),
            revoked_at: None,
            record_type,
            granted_by: actor,
            revoked_by: None,
            supersedes: None,
            roles: self.complete_roles(roles),
        };
        let stored = self.insert(tx, &record).await?;

        info!(
            kind = %self.kind.name,
            record = stored.id,
            parent = parent_id,
            subject = %subject,
            record_type = %record_type,
            "membership granted"
        );
        Ok(stored)
    }

    /// Withdraw a record. Revocation is terminal.
    pub async fn revoke(
        &self,
        tx: &mut dyn Transaction,
        record: &mut MembershipRecord,
        actor: IdentityId,
    ) -> LedgerResult<()> {
        if record.is_revoked() {
            return Err(LedgerError::AlreadyRevoked {
                record_id: record.id,
            });
        }
        self.persist_revocation(tx, record, actor, Utc::now()).await?;
        info!(kind = %self.kind.name, record = record.id, actor = %actor, "membership revoked");
        Ok(())
    }

    /// Change role flags by superseding the record with an `AMEND` row.
    ///
    /// Returns the record unchanged when every supplied flag already holds.
    pub async fn replace(
        &self,
        tx: &mut dyn Transaction,
        record: &mut MembershipRecord,
        actor: IdentityId,
        updates: &RoleFlags,
    ) -> LedgerResult<MembershipRecord> {
        if record.record_type == RecordType::Invite {
            return Err(LedgerError::InvalidRecordType {
                operation: "replace",
                record_type: record.record_type,
            });
        }
        if record.is_revoked() {
            return Err(LedgerError::AlreadyRevoked {
                record_id: record.id,
            });
        }
        self.check_fields(updates)?;

        if updates.iter().all(|(column, flag)| record.role(column) == *flag) {
            debug!(kind = %self.kind.name, record = record.id, "replace is a no-op");
            return Ok(record.clone());
        }
        self.supersede(tx, record, actor, updates, RecordType::Amend)
            .await
    }

    /// Turn a pending invite into an `ACCEPT` row carrying the invited roles.
    pub async fn accept(
        &self,
        tx: &mut dyn Transaction,
        record: &mut MembershipRecord,
        actor: IdentityId,
    ) -> LedgerResult<MembershipRecord> {
        if record.record_type != RecordType::Invite {
            return Err(LedgerError::InvalidRecordType {
                operation: "accept",
                record_type: record.record_type,
            });
        }
        if record.is_revoked() {
            return Err(LedgerError::AlreadyRevoked {
                record_id: record.id,
            });
        }
        if let Some(active) = self.active(tx, record.parent_id, record.subject).await? {
            return Err(LedgerError::AlreadyActive {
                record_id: active.id,
            });
        }
        self.supersede(tx, record, actor, &RoleFlags::new(), RecordType::Accept)
            .await
    }

    pub async fn get(
        &self,
        tx: &mut dyn Transaction,
        record_id: i64,
    ) -> LedgerResult<Option<MembershipRecord>> {
        let row = tx
            .select_one(&self.kind.table, &Filter::by(columns::ID, record_id))
            .await?;
        row.map(|row| MembershipRecord::from_row(&self.kind, &row))
            .transpose()
    }

    /// The single active record for a (parent, subject) pair.
    pub async fn active(
        &self,
        tx: &mut dyn Transaction,
        parent_id: i64,
        subject: IdentityId,
    ) -> LedgerResult<Option<MembershipRecord>> {
        let mut filter = self.kind.pair_filter(parent_id, subject);
        for clause in MembershipKind::active_predicate().clauses() {
            filter = filter.with(clause.column.clone(), clause.predicate.clone());
        }
        let row = tx.select_one(&self.kind.table, &filter).await?;
        row.map(|row| MembershipRecord::from_row(&self.kind, &row))
            .transpose()
    }

    /// The newest invite for the pair that is still open.
    pub async fn pending_invite(
        &self,
        tx: &mut dyn Transaction,
        parent_id: i64,
        subject: IdentityId,
    ) -> LedgerResult<Option<MembershipRecord>> {
        Ok(self
            .history(tx, parent_id, subject)
            .await?
            .into_iter()
            .filter(MembershipRecord::is_pending_invite)
            .max_by_key(|record| record.id))
    }

    /// Every row ever written for the pair, oldest first.
    pub async fn history(
        &self,
        tx: &mut dyn Transaction,
        parent_id: i64,
        subject: IdentityId,
    ) -> LedgerResult<Vec<MembershipRecord>> {
        self.load(tx, &self.kind.pair_filter(parent_id, subject))
            .await
    }

    /// Every row held by `subject` across all parents, oldest first.
    pub async fn for_subject(
        &self,
        tx: &mut dyn Transaction,
        subject: IdentityId,
    ) -> LedgerResult<Vec<MembershipRecord>> {
        self.load(tx, &Filter::by(columns::SUBJECT, subject.get()))
            .await
    }

    /// Active records on one parent, ordered by id.
    pub async fn members_of(
        &self,
        tx: &mut dyn Transaction,
        parent_id: i64,
    ) -> LedgerResult<Vec<MembershipRecord>> {
        let mut filter = Filter::by(self.kind.parent_column.clone(), parent_id);
        for clause in MembershipKind::active_predicate().clauses() {
            filter = filter.with(clause.column.clone(), clause.predicate.clone());
        }
        self.load(tx, &filter).await
    }

    /// Walk `supersedes` links from `record` back to the original grant.
    /// The first element is `record` itself.
    pub async fn lineage(
        &self,
        tx: &mut dyn Transaction,
        record: &MembershipRecord,
    ) -> LedgerResult<Vec<MembershipRecord>> {
        let mut chain = vec![record.clone()];
        let mut seen = HashSet::from([record.id]);
        let mut next = record.supersedes;

        while let Some(id) = next {
            if !seen.insert(id) {
                return Err(LedgerError::Corrupt(format!(
                    "{} supersedes chain loops at row {}",
                    self.kind.table, id
                )));
            }
            let previous = self.get(tx, id).await?.ok_or(LedgerError::NotFound(id))?;
            next = previous.supersedes;
            chain.push(previous);
        }
        Ok(chain)
    }

    /// Read-side contract for the authorization layer.
    pub fn offered_roles(&self, record: &MembershipRecord) -> BTreeSet<String> {
        record.offered_roles(&self.kind)
    }

    async fn supersede(
        &self,
        tx: &mut dyn Transaction,
        record: &mut MembershipRecord,
        actor: IdentityId,
        updates: &RoleFlags,
        record_type: RecordType,
    ) -> LedgerResult<MembershipRecord> {
        let now = Utc::now();
        // Revoke first: the active-row constraint would reject the successor otherwise.
        self.mark_revoked(tx, record.id, actor, now).await?;

        let mut roles = record.roles.clone();
        roles.extend(updates.iter().map(|(column, flag)| (column.clone(), *flag)));

        let successor = MembershipRecord {
            id: 0,
            parent_id: record.parent_id,
            subject: record.subject,
            granted_at: now,
            revoked_at: None,
            record_type,
            granted_by: record.granted_by,
            revoked_by: None,
            supersedes: Some(record.id),
            roles,
        };
        let stored = match self.insert(tx, &successor).await {
            Ok(stored) => stored,
            Err(err) => {
                self.reopen(tx, record.id).await?;
                return Err(err);
            }
        };
        record.revoked_at = Some(now);
        record.revoked_by = Some(actor);

        info!(
            kind = %self.kind.name,
            record = stored.id,
            supersedes = record.id,
            actor = %actor,
            record_type = %record_type,
            "membership superseded"
        );
        Ok(stored)
    }

    async fn persist_revocation(
        &self,
        tx: &mut dyn Transaction,
        record: &mut MembershipRecord,
        actor: IdentityId,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.mark_revoked(tx, record.id, actor, at).await?;
        record.revoked_at = Some(at);
        record.revoked_by = Some(actor);
        Ok(())
    }

    /// Guarded revocation: only a row that is still open is touched.
    async fn mark_revoked(
        &self,
        tx: &mut dyn Transaction,
        record_id: i64,
        actor: IdentityId,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let changes = Row::new()
            .with(columns::REVOKED_AT, at)
            .with(columns::REVOKED_BY, actor.get());
        let filter = Filter::by(columns::ID, record_id).is_null(columns::REVOKED_AT);
        let updated = tx.update(&self.kind.table, &filter, &changes).await?;
        if updated == 0 {
            // Someone else revoked it first, or the row is gone.
            return Err(LedgerError::AlreadyRevoked { record_id });
        }
        Ok(())
    }

    /// Undo a revocation made earlier in the same transaction whose successor
    /// could not be written.
    async fn reopen(&self, tx: &mut dyn Transaction, record_id: i64) -> LedgerResult<()> {
        let changes = Row::new()
            .with(columns::REVOKED_AT, Value::Null)
            .with(columns::REVOKED_BY, Value::Null);
        tx.update(&self.kind.table, &Filter::by(columns::ID, record_id), &changes)
            .await?;
        debug!(kind = %self.kind.name, record = record_id, "revocation undone");
        Ok(())
    }

    async fn insert(
        &self,
        tx: &mut dyn Transaction,
        record: &MembershipRecord,
    ) -> LedgerResult<MembershipRecord> {
        let stored = tx
            .insert(&self.kind.table, record.insert_row(&self.kind))
            .await?;
        MembershipRecord::from_row(&self.kind, &stored)
    }

    async fn load(
        &self,
        tx: &mut dyn Transaction,
        filter: &Filter,
    ) -> LedgerResult<Vec<MembershipRecord>> {
        let mut records = tx
            .select(&self.kind.table, filter)
            .await?
            .iter()
            .map(|row| MembershipRecord::from_row(&self.kind, row))
            .collect::<LedgerResult<Vec<_>>>()?;
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    fn check_fields(&self, roles: &RoleFlags) -> LedgerResult<()> {
        match roles.keys().find(|column| !self.kind.declares(column)) {
            Some(field) => Err(LedgerError::InvalidField {
                kind: self.kind.name.clone(),
                field: field.clone(),
            }),
            None => Ok(()),
        }
    }

    fn complete_roles(&self, roles: &RoleFlags) -> RoleFlags {
        self.kind
            .role_columns
            .iter()
            .map(|role| {
                let flag = roles.get(&role.column).copied().unwrap_or(false);
                (role.column.clone(), flag)
            })
            .collect()
    }
}
