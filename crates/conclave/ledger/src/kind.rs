use conclave_storage::{ColumnType, Filter, TableDescriptor};
use conclave_types::{IdentityId, RecordType};
use serde::{Deserialize, Serialize};

/// Column names shared by every membership table.
pub mod columns {
    pub const ID: &str = "id";
    pub const SUBJECT: &str = "subject_id";
    pub const GRANTED_AT: &str = "granted_at";
    pub const REVOKED_AT: &str = "revoked_at";
    pub const RECORD_TYPE: &str = "record_type";
    pub const GRANTED_BY: &str = "granted_by_id";
    pub const REVOKED_BY: &str = "revoked_by_id";
    pub const SUPERSEDES: &str = "supersedes_id";
}

/// A boolean role column and the role name it offers when set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleColumn {
    pub column: String,
    pub role: String,
}

/// A concrete membership subtype: which parent it attaches to and which role
/// flags it carries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipKind {
    pub name: String,
    pub table: String,
    pub parent_table: String,
    pub parent_column: String,
    pub identity_table: String,
    pub identity_key: String,
    pub role_columns: Vec<RoleColumn>,
}

impl MembershipKind {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        parent_table: impl Into<String>,
        parent_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            parent_table: parent_table.into(),
            parent_column: parent_column.into(),
            identity_table: "identity".to_string(),
            identity_key: "id".to_string(),
            role_columns: Vec::new(),
        }
    }

    pub fn with_identity_table(mut self, table: impl Into<String>, key: impl Into<String>) -> Self {
        self.identity_table = table.into();
        self.identity_key = key.into();
        self
    }

    pub fn role(mut self, column: impl Into<String>, role: impl Into<String>) -> Self {
        self.role_columns.push(RoleColumn {
            column: column.into(),
            role: role.into(),
        });
        self
    }

    pub fn declares(&self, column: &str) -> bool {
        self.role_columns.iter().any(|r| r.column == column)
    }

    pub fn active_constraint_name(&self) -> String {
        format!("{}_active_key", self.table)
    }

    /// Rows that count as the active grant: not revoked and not an invite.
    pub fn active_predicate() -> Filter {
        Filter::all()
            .is_null(columns::REVOKED_AT)
            .ne(columns::RECORD_TYPE, RecordType::Invite.as_str())
    }

    pub fn pair_filter(&self, parent: i64, subject: IdentityId) -> Filter {
        Filter::by(self.parent_column.clone(), parent).eq(columns::SUBJECT, subject.get())
    }

    /// Table layout for this kind, including the single-active constraint.
    pub fn descriptor(&self) -> TableDescriptor {
        let mut descriptor = TableDescriptor::new(self.table.clone())
            .with_id()
            .column(self.parent_column.clone(), ColumnType::Int)
            .column(columns::SUBJECT, ColumnType::Int)
            .column(columns::GRANTED_AT, ColumnType::Timestamp)
            .nullable(columns::REVOKED_AT, ColumnType::Timestamp)
            .column(columns::RECORD_TYPE, ColumnType::Text)
            .nullable(columns::GRANTED_BY, ColumnType::Int)
            .nullable(columns::REVOKED_BY, ColumnType::Int)
            .nullable(columns::SUPERSEDES, ColumnType::Int);

        for role in &self.role_columns {
            descriptor = descriptor.column(role.column.clone(), ColumnType::Bool);
        }

        descriptor
            .references(self.parent_column.clone(), self.parent_table.clone(), "id")
            .references(columns::SUBJECT, self.identity_table.clone(), self.identity_key.clone())
            .references(columns::GRANTED_BY, self.identity_table.clone(), self.identity_key.clone())
            .references(columns::REVOKED_BY, self.identity_table.clone(), self.identity_key.clone())
            .references(columns::SUPERSEDES, self.table.clone(), columns::ID)
            .unique_where(
                self.active_constraint_name(),
                &[self.parent_column.as_str(), columns::SUBJECT],
                Self::active_predicate(),
            )
    }
}
