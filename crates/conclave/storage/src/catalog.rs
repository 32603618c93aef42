//! Enumerable description of the tables hosted by a store.
//!
//! The catalog is plain data: it is built once (by hand for the in-memory
//! adapter, by introspection for Postgres) and then only read. Consolidation
//! walks it in table-name order so that repeated runs touch tables in the
//! same sequence.

use crate::model::{Filter, Value};
use crate::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Partition name used when a table does not declare one.
pub const DEFAULT_PARTITION: &str = "primary";

/// Constraint name reported when a column belongs to the primary key.
pub const PRIMARY_KEY_CONSTRAINT: &str = "primary key";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int,
    Text,
    Bool,
    Timestamp,
}

impl ColumnType {
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (ColumnType::Int, Value::Int(_))
                | (ColumnType::Text, Value::Text(_))
                | (ColumnType::Bool, Value::Bool(_))
                | (ColumnType::Timestamp, Value::Timestamp(_))
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

/// Single- or multi-column uniqueness. A `predicate` makes the constraint
/// partial: only rows matching it take part.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub name: String,
    pub columns: Vec<String>,
    pub predicate: Option<Filter>,
}

impl UniqueConstraint {
    pub fn covers(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    /// Storage partition hosting the table. Writes to a table outside the
    /// coordinating transaction's partition are not covered by its atomicity.
    pub partition: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
    pub unique_constraints: Vec<UniqueConstraint>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition: DEFAULT_PARTITION.to_string(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            unique_constraints: Vec::new(),
        }
    }

    /// Add a generated integer `id` primary key.
    pub fn with_id(self) -> Self {
        self.column("id", ColumnType::Int).primary_key(&["id"])
    }

    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            column_type,
            nullable: false,
        });
        self
    }

    pub fn nullable(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            column_type,
            nullable: true,
        });
        self
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn references(
        mut self,
        column: impl Into<String>,
        table: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            references_table: table.into(),
            references_column: target_column.into(),
        });
        self
    }

    pub fn unique(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.unique_constraints.push(UniqueConstraint {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            predicate: None,
        });
        self
    }

    pub fn unique_where(
        mut self,
        name: impl Into<String>,
        columns: &[&str],
        predicate: Filter,
    ) -> Self {
        self.unique_constraints.push(UniqueConstraint {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            predicate: Some(predicate),
        });
        self
    }

    pub fn in_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_def(name).is_some()
    }

    /// Foreign keys of this table that point at `table.column`.
    pub fn foreign_keys_to<'a>(
        &'a self,
        table: &'a str,
        column: &'a str,
    ) -> impl Iterator<Item = &'a ForeignKey> + 'a {
        self.foreign_keys
            .iter()
            .filter(move |fk| fk.references_table == table && fk.references_column == column)
    }

    /// Name of the first uniqueness constraint (primary key included) that
    /// `column` takes part in.
    pub fn uniqueness_covering(&self, column: &str) -> Option<&str> {
        if self.primary_key.iter().any(|c| c == column) {
            return Some(PRIMARY_KEY_CONSTRAINT);
        }
        self.unique_constraints
            .iter()
            .find(|constraint| constraint.covers(column))
            .map(|constraint| constraint.name.as_str())
    }

    /// The primary key column the store fills in when an insert omits it.
    pub fn generated_key(&self) -> Option<&str> {
        match self.primary_key.as_slice() {
            [single] => self
                .column_def(single)
                .filter(|def| def.column_type == ColumnType::Int)
                .map(|def| def.name.as_str()),
            _ => None,
        }
    }

    /// Check that every key and constraint names a declared column.
    pub fn validate(&self) -> StorageResult<()> {
        let missing = |column: &str| {
            StorageError::InvalidInput(format!(
                "table {} references undeclared column {}",
                self.name, column
            ))
        };

        for column in &self.primary_key {
            if !self.has_column(column) {
                return Err(missing(column));
            }
        }
        for fk in &self.foreign_keys {
            if !self.has_column(&fk.column) {
                return Err(missing(&fk.column));
            }
        }
        for constraint in &self.unique_constraints {
            if constraint.columns.is_empty() {
                return Err(StorageError::InvalidInput(format!(
                    "unique constraint {} on {} has no columns",
                    constraint.name, self.name
                )));
            }
            if let Some(column) = constraint.columns.iter().find(|c| !self.has_column(c)) {
                return Err(missing(column));
            }
        }
        Ok(())
    }
}

/// Every table known to a store, ordered by name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCatalog {
    tables: BTreeMap<String, TableDescriptor>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, descriptor: TableDescriptor) -> StorageResult<()> {
        descriptor.validate()?;
        if self.tables.contains_key(&descriptor.name) {
            return Err(StorageError::TableExists(descriptor.name.clone()));
        }
        self.tables.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Tables holding at least one foreign key to `table.column`.
    pub fn referencing<'a>(
        &'a self,
        table: &'a str,
        column: &'a str,
    ) -> impl Iterator<Item = &'a TableDescriptor> + 'a {
        self.tables
            .values()
            .filter(move |descriptor| descriptor.foreign_keys_to(table, column).next().is_some())
    }
}

impl FromIterator<TableDescriptor> for SchemaCatalog {
    /// Builds without validation; later duplicates replace earlier ones.
    fn from_iter<I: IntoIterator<Item = TableDescriptor>>(iter: I) -> Self {
        Self {
            tables: iter
                .into_iter()
                .map(|descriptor| (descriptor.name.clone(), descriptor))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote_table() -> TableDescriptor {
        TableDescriptor::new("comment_vote")
            .with_id()
            .column("voter_id", ColumnType::Int)
            .column("comment_id", ColumnType::Int)
            .nullable("reviewer_id", ColumnType::Int)
            .references("voter_id", "identity", "id")
            .references("reviewer_id", "identity", "id")
            .unique("comment_vote_voter_key", &["voter_id", "comment_id"])
    }

    #[test]
    fn uniqueness_covering_reports_constraint_names() {
        let table = vote_table();
        assert_eq!(table.uniqueness_covering("id"), Some(PRIMARY_KEY_CONSTRAINT));
        assert_eq!(
            table.uniqueness_covering("voter_id"),
            Some("comment_vote_voter_key")
        );
        assert_eq!(table.uniqueness_covering("reviewer_id"), None);
    }

    #[test]
    fn generated_key_requires_single_int_primary_key() {
        assert_eq!(vote_table().generated_key(), Some("id"));

        let association = TableDescriptor::new("user_group_membership")
            .column("group_id", ColumnType::Int)
            .column("identity_id", ColumnType::Int)
            .primary_key(&["group_id", "identity_id"]);
        assert_eq!(association.generated_key(), None);
    }

    #[test]
    fn validate_rejects_undeclared_columns() {
        let table = TableDescriptor::new("broken")
            .with_id()
            .unique("broken_key", &["nope"]);
        assert!(matches!(
            table.validate(),
            Err(StorageError::InvalidInput(_))
        ));
    }

    #[test]
    fn catalog_iterates_in_name_order_and_finds_referencing_tables() {
        let mut catalog = SchemaCatalog::new();
        catalog
            .insert(TableDescriptor::new("identity").with_id())
            .unwrap();
        catalog.insert(vote_table()).unwrap();
        catalog
            .insert(TableDescriptor::new("auth_client").with_id())
            .unwrap();

        let names: Vec<_> = catalog.table_names().collect();
        assert_eq!(names, vec!["auth_client", "comment_vote", "identity"]);

        let referencing: Vec<_> = catalog
            .referencing("identity", "id")
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(referencing, vec!["comment_vote"]);

        assert!(matches!(
            catalog.insert(vote_table()),
            Err(StorageError::TableExists(_))
        ));
    }
}
