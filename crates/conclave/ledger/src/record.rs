use crate::kind::{columns, MembershipKind};
use crate::{LedgerError, LedgerResult};
use chrono::{DateTime, Utc};
use conclave_storage::{Row, Value};
use conclave_types::{IdentityId, RecordType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Role column name to flag value.
pub type RoleFlags = BTreeMap<String, bool>;

/// One immutable membership row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub id: i64,
    pub parent_id: i64,
    pub subject: IdentityId,
    pub granted_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub record_type: RecordType,
    pub granted_by: Option<IdentityId>,
    pub revoked_by: Option<IdentityId>,
    /// The row this one replaced, if it was produced by `replace` or `accept`.
    pub supersedes: Option<i64>,
    pub roles: RoleFlags,
}

impl MembershipRecord {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Invites never count as active, whatever their revocation state.
    pub fn is_active(&self) -> bool {
        !self.is_revoked() && self.record_type != RecordType::Invite
    }

    pub fn is_pending_invite(&self) -> bool {
        !self.is_revoked() && self.record_type == RecordType::Invite
    }

    pub fn role(&self, column: &str) -> bool {
        self.roles.get(column).copied().unwrap_or(false)
    }

    /// Role names this record entitles its subject to, as read by the
    /// authorization layer. Empty unless the record is active.
    pub fn offered_roles(&self, kind: &MembershipKind) -> BTreeSet<String> {
        if !self.is_active() {
            return BTreeSet::new();
        }
        kind.role_columns
            .iter()
            .filter(|role| self.role(&role.column))
            .map(|role| role.role.clone())
            .collect()
    }

    pub(crate) fn from_row(kind: &MembershipKind, row: &Row) -> LedgerResult<Self> {
        let corrupt = |column: &str| {
            LedgerError::Corrupt(format!(
                "{} row {} has no valid {}",
                kind.table,
                row.value(columns::ID),
                column
            ))
        };
        let optional_identity = |column: &str| -> LedgerResult<Option<IdentityId>> {
            match row.value(column) {
                Value::Null => Ok(None),
                Value::Int(id) => Ok(Some(IdentityId(*id))),
                _ => Err(corrupt(column)),
            }
        };

        let record_type = row
            .text(columns::RECORD_TYPE)
            .ok_or_else(|| corrupt(columns::RECORD_TYPE))?
            .parse::<RecordType>()
            .map_err(|e| LedgerError::Corrupt(e.to_string()))?;

        let roles = kind
            .role_columns
            .iter()
            .map(|role| {
                row.bool(&role.column)
                    .map(|flag| (role.column.clone(), flag))
                    .ok_or_else(|| corrupt(&role.column))
            })
            .collect::<LedgerResult<RoleFlags>>()?;

        Ok(Self {
            id: row.int(columns::ID).ok_or_else(|| corrupt(columns::ID))?,
            parent_id: row
                .int(&kind.parent_column)
                .ok_or_else(|| corrupt(&kind.parent_column))?,
            subject: IdentityId(
                row.int(columns::SUBJECT)
                    .ok_or_else(|| corrupt(columns::SUBJECT))?,
            ),
            granted_at: row
                .timestamp(columns::GRANTED_AT)
                .ok_or_else(|| corrupt(columns::GRANTED_AT))?,
            revoked_at: row.timestamp(columns::REVOKED_AT),
            record_type,
            granted_by: optional_identity(columns::GRANTED_BY)?,
            revoked_by: optional_identity(columns::REVOKED_BY)?,
            supersedes: row.int(columns::SUPERSEDES),
            roles,
        })
    }

    /// Column values for inserting a new row; the store assigns `id`.
    pub(crate) fn insert_row(&self, kind: &MembershipKind) -> Row {
        let mut row = Row::new()
            .with(kind.parent_column.clone(), self.parent_id)
            .with(columns::SUBJECT, self.subject.get())
            .with(columns::GRANTED_AT, self.granted_at)
            .with(columns::REVOKED_AT, self.revoked_at)
            .with(columns::RECORD_TYPE, self.record_type.as_str())
            .with(columns::GRANTED_BY, self.granted_by.map(IdentityId::get))
            .with(columns::REVOKED_BY, self.revoked_by.map(IdentityId::get))
            .with(columns::SUPERSEDES, self.supersedes);
        for role in &kind.role_columns {
            row.set(role.column.clone(), self.role(&role.column));
        }
        row
    }
}
