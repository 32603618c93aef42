//! In-memory reference implementation of the store contract.
//!
//! This adapter is deterministic and test-friendly. Each transaction works on
//! a private copy of the database and holds the store's write lock until it
//! commits or rolls back, so transactions are fully serialized. Uniqueness
//! (including partial constraints), foreign keys, column types and
//! nullability are enforced on every write, and a rejected write leaves the
//! transaction's working copy untouched.

use crate::catalog::{SchemaCatalog, TableDescriptor, DEFAULT_PARTITION, PRIMARY_KEY_CONSTRAINT};
use crate::model::{Filter, Row, Value};
use crate::traits::{Store, Transaction};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Clone, Debug)]
struct TableData {
    descriptor: TableDescriptor,
    rows: Vec<Row>,
    next_key: i64,
}

#[derive(Clone, Debug, Default)]
struct Database {
    tables: BTreeMap<String, TableData>,
    commits: u64,
}

impl Database {
    fn table(&self, name: &str) -> StorageResult<&TableData> {
        self.tables
            .get(name)
            .ok_or_else(|| StorageError::NotFound(format!("table {name} not found")))
    }

    fn table_mut(&mut self, name: &str) -> StorageResult<&mut TableData> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(format!("table {name} not found")))
    }
}

/// In-memory store adapter.
#[derive(Clone)]
pub struct InMemoryStore {
    partition: String,
    state: Arc<Mutex<Database>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_partition(DEFAULT_PARTITION)
    }

    pub fn with_partition(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            state: Arc::new(Mutex::new(Database::default())),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Register a table. Foreign keys must target tables created earlier.
    pub async fn create_table(&self, descriptor: TableDescriptor) -> StorageResult<()> {
        descriptor.validate()?;
        let mut db = self.state.lock().await;

        if db.tables.contains_key(&descriptor.name) {
            return Err(StorageError::TableExists(descriptor.name.clone()));
        }
        for fk in &descriptor.foreign_keys {
            let target_known = fk.references_table == descriptor.name
                && descriptor.has_column(&fk.references_column)
                || db
                    .tables
                    .get(&fk.references_table)
                    .is_some_and(|t| t.descriptor.has_column(&fk.references_column));
            if !target_known {
                return Err(StorageError::InvalidInput(format!(
                    "foreign key {}.{} targets unknown column {}.{}",
                    descriptor.name, fk.column, fk.references_table, fk.references_column
                )));
            }
        }

        debug!(table = %descriptor.name, partition = %descriptor.partition, "table created");
        db.tables.insert(
            descriptor.name.clone(),
            TableData {
                descriptor,
                rows: Vec::new(),
                next_key: 1,
            },
        );
        Ok(())
    }

    /// Committed rows of every table, keyed by table name.
    pub async fn snapshot(&self) -> BTreeMap<String, Vec<Row>> {
        let db = self.state.lock().await;
        db.tables
            .iter()
            .map(|(name, table)| (name.clone(), table.rows.clone()))
            .collect()
    }

    /// Committed rows of one table.
    pub async fn rows(&self, table: &str) -> StorageResult<Vec<Row>> {
        let db = self.state.lock().await;
        Ok(db.table(table)?.rows.clone())
    }

    /// Number of transactions committed so far.
    pub async fn commit_count(&self) -> u64 {
        self.state.lock().await.commits
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn catalog(&self) -> StorageResult<SchemaCatalog> {
        let db = self.state.lock().await;
        Ok(db
            .tables
            .values()
            .map(|table| table.descriptor.clone())
            .collect())
    }

    async fn begin(&self) -> StorageResult<Box<dyn Transaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTransaction {
            partition: self.partition.clone(),
            guard: Some(guard),
            working,
        }))
    }
}

/// Transaction over a private copy of the database.
pub struct InMemoryTransaction {
    partition: String,
    guard: Option<OwnedMutexGuard<Database>>,
    working: Database,
}

impl InMemoryTransaction {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.guard.is_none() {
            return Err(StorageError::InvariantViolation(
                "transaction already finished".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    fn partition(&self) -> &str {
        &self.partition
    }

    async fn select(&mut self, table: &str, filter: &Filter) -> StorageResult<Vec<Row>> {
        self.ensure_open()?;
        let data = self.working.table(table)?;
        check_filter_columns(&data.descriptor, filter)?;
        Ok(data
            .rows
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    async fn insert(&mut self, table: &str, row: Row) -> StorageResult<Row> {
        self.ensure_open()?;
        let data = self.working.table(table)?;
        let descriptor = &data.descriptor;

        let mut stored = row;
        let mut next_key = data.next_key;
        if let Some(key) = descriptor.generated_key() {
            match stored.int(key) {
                Some(explicit) => next_key = next_key.max(explicit + 1),
                None => {
                    stored.set(key, next_key);
                    next_key += 1;
                }
            }
        }
        for column in &descriptor.columns {
            if !stored.contains(&column.name) {
                stored.set(column.name.clone(), Value::Null);
            }
        }
        check_row(descriptor, &stored)?;
        check_references(&self.working, descriptor, std::slice::from_ref(&stored))?;

        let mut rows = data.rows.clone();
        rows.push(stored.clone());
        check_unique(descriptor, &rows)?;

        let data = self.working.table_mut(table)?;
        data.rows = rows;
        data.next_key = next_key;
        Ok(stored)
    }

    async fn update(&mut self, table: &str, filter: &Filter, changes: &Row) -> StorageResult<u64> {
        self.ensure_open()?;
        let data = self.working.table(table)?;
        let descriptor = &data.descriptor;
        check_filter_columns(descriptor, filter)?;

        let mut rows = data.rows.clone();
        let mut touched = Vec::new();
        for row in rows.iter_mut().filter(|row| filter.matches(row)) {
            row.apply(changes);
            check_row(descriptor, row)?;
            touched.push(row.clone());
        }
        if touched.is_empty() {
            return Ok(0);
        }
        check_references(&self.working, descriptor, &touched)?;
        check_unique(descriptor, &rows)?;

        self.working.table_mut(table)?.rows = rows;
        Ok(touched.len() as u64)
    }

    async fn delete(&mut self, table: &str, filter: &Filter) -> StorageResult<u64> {
        self.ensure_open()?;
        let data = self.working.table(table)?;
        check_filter_columns(&data.descriptor, filter)?;

        let (removed, kept): (Vec<Row>, Vec<Row>) =
            data.rows.iter().cloned().partition(|row| filter.matches(row));
        if removed.is_empty() {
            return Ok(0);
        }
        check_not_referenced(&self.working, table, &removed)?;

        self.working.table_mut(table)?.rows = kept;
        Ok(removed.len() as u64)
    }

    async fn commit(&mut self) -> StorageResult<()> {
        let mut guard = self.guard.take().ok_or_else(|| {
            StorageError::InvariantViolation("transaction already finished".to_string())
        })?;
        let mut working = std::mem::take(&mut self.working);
        working.commits = guard.commits + 1;
        *guard = working;
        Ok(())
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        self.guard = None;
        self.working = Database::default();
        Ok(())
    }
}

fn check_filter_columns(descriptor: &TableDescriptor, filter: &Filter) -> StorageResult<()> {
    match filter
        .clauses()
        .iter()
        .find(|clause| !descriptor.has_column(&clause.column))
    {
        Some(clause) => Err(StorageError::InvalidInput(format!(
            "column {} does not exist on {}",
            clause.column, descriptor.name
        ))),
        None => Ok(()),
    }
}

fn check_row(descriptor: &TableDescriptor, row: &Row) -> StorageResult<()> {
    for (column, value) in row.columns() {
        let def = descriptor.column_def(column).ok_or_else(|| {
            StorageError::InvalidInput(format!(
                "column {} does not exist on {}",
                column, descriptor.name
            ))
        })?;
        if !def.column_type.accepts(value) {
            return Err(StorageError::InvalidInput(format!(
                "value {} does not fit {}.{} ({:?})",
                value, descriptor.name, column, def.column_type
            )));
        }
        if value.is_null() && !def.nullable {
            return Err(StorageError::InvalidInput(format!(
                "null value in non-nullable column {}.{}",
                descriptor.name, column
            )));
        }
    }
    Ok(())
}

fn check_references(db: &Database, descriptor: &TableDescriptor, rows: &[Row]) -> StorageResult<()> {
    for fk in &descriptor.foreign_keys {
        let target_rows = if fk.references_table == descriptor.name {
            None
        } else {
            Some(&db.table(&fk.references_table)?.rows)
        };
        for row in rows {
            let value = row.value(&fk.column);
            if value.is_null() {
                continue;
            }
            let found = match target_rows {
                Some(targets) => targets
                    .iter()
                    .any(|target| target.value(&fk.references_column) == value),
                None => db
                    .table(&descriptor.name)?
                    .rows
                    .iter()
                    .chain(rows.iter())
                    .any(|target| target.value(&fk.references_column) == value),
            };
            if !found {
                return Err(StorageError::ReferenceViolation {
                    table: descriptor.name.clone(),
                    detail: format!(
                        "{} = {} has no matching {}.{}",
                        fk.column, value, fk.references_table, fk.references_column
                    ),
                });
            }
        }
    }
    Ok(())
}

fn check_not_referenced(db: &Database, table: &str, removed: &[Row]) -> StorageResult<()> {
    for other in db.tables.values() {
        for fk in other
            .descriptor
            .foreign_keys
            .iter()
            .filter(|fk| fk.references_table == table)
        {
            let removed_keys: HashSet<&Value> = removed
                .iter()
                .map(|row| row.value(&fk.references_column))
                .filter(|value| !value.is_null())
                .collect();
            let dangling = other.rows.iter().any(|row| {
                let in_removed_set = other.descriptor.name == table && removed.contains(row);
                !in_removed_set && removed_keys.contains(row.value(&fk.column))
            });
            if dangling {
                return Err(StorageError::ReferenceViolation {
                    table: table.to_string(),
                    detail: format!(
                        "rows are still referenced by {}.{}",
                        other.descriptor.name, fk.column
                    ),
                });
            }
        }
    }
    Ok(())
}

fn check_unique(descriptor: &TableDescriptor, rows: &[Row]) -> StorageResult<()> {
    let primary = (!descriptor.primary_key.is_empty())
        .then_some((PRIMARY_KEY_CONSTRAINT, descriptor.primary_key.as_slice(), None));
    let constraints = primary.into_iter().chain(
        descriptor
            .unique_constraints
            .iter()
            .map(|c| (c.name.as_str(), c.columns.as_slice(), c.predicate.as_ref())),
    );

    for (name, columns, predicate) in constraints {
        let mut seen: HashSet<Vec<&Value>> = HashSet::new();
        for row in rows {
            if predicate.is_some_and(|p| !p.matches(row)) {
                continue;
            }
            let key: Vec<&Value> = columns.iter().map(|c| row.value(c)).collect();
            if key.iter().any(|v| v.is_null()) {
                continue;
            }
            if !seen.insert(key) {
                return Err(StorageError::UniqueViolation {
                    table: descriptor.name.clone(),
                    constraint: name.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnType;

    async fn seeded_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .create_table(TableDescriptor::new("identity").with_id())
            .await
            .unwrap();
        store
            .create_table(
                TableDescriptor::new("membership")
                    .with_id()
                    .column("subject_id", ColumnType::Int)
                    .column("record_type", ColumnType::Text)
                    .nullable("revoked_at", ColumnType::Timestamp)
                    .references("subject_id", "identity", "id")
                    .unique_where(
                        "membership_active_key",
                        &["subject_id"],
                        Filter::all().is_null("revoked_at").ne("record_type", "INVITE"),
                    ),
            )
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert("identity", Row::new()).await.unwrap();
        tx.insert("identity", Row::new()).await.unwrap();
        tx.commit().await.unwrap();
        store
    }

    #[tokio::test]
    async fn inserts_generate_keys_and_fill_nullable_columns() {
        let store = seeded_store().await;
        let mut tx = store.begin().await.unwrap();
        let row = tx
            .insert(
                "membership",
                Row::new().with("subject_id", 1).with("record_type", "DIRECT_ADD"),
            )
            .await
            .unwrap();
        assert_eq!(row.int("id"), Some(1));
        assert_eq!(row.value("revoked_at"), &Value::Null);
    }

    #[tokio::test]
    async fn partial_unique_constraint_ignores_rows_outside_predicate() {
        let store = seeded_store().await;
        let mut tx = store.begin().await.unwrap();
        let invite = Row::new().with("subject_id", 1).with("record_type", "INVITE");
        tx.insert("membership", invite.clone()).await.unwrap();
        tx.insert("membership", invite).await.unwrap();

        let active = Row::new().with("subject_id", 1).with("record_type", "DIRECT_ADD");
        tx.insert("membership", active.clone()).await.unwrap();
        let err = tx.insert("membership", active).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::UniqueViolation { ref constraint, .. } if constraint == "membership_active_key"
        ));

        // The rejected insert left the working copy intact.
        let rows = tx.select("membership", &Filter::all()).await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced_on_insert_update_and_delete() {
        let store = seeded_store().await;
        let mut tx = store.begin().await.unwrap();

        let err = tx
            .insert(
                "membership",
                Row::new().with("subject_id", 99).with("record_type", "INVITE"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ReferenceViolation { .. }));

        tx.insert(
            "membership",
            Row::new().with("subject_id", 1).with("record_type", "INVITE"),
        )
        .await
        .unwrap();
        let err = tx
            .update(
                "membership",
                &Filter::by("subject_id", 1),
                &Row::new().with("subject_id", 42),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ReferenceViolation { .. }));

        let err = tx
            .delete("identity", &Filter::by("id", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ReferenceViolation { .. }));
        assert!(err.is_constraint_violation());
        assert_eq!(tx.delete("identity", &Filter::by("id", 2)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rollback_and_drop_discard_writes() {
        let store = seeded_store().await;
        let before = store.snapshot().await;

        let mut tx = store.begin().await.unwrap();
        tx.insert(
            "membership",
            Row::new().with("subject_id", 2).with("record_type", "DIRECT_ADD"),
        )
        .await
        .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.snapshot().await, before);

        {
            let mut tx = store.begin().await.unwrap();
            tx.update("identity", &Filter::all(), &Row::new()).await.unwrap();
            tx.delete("identity", &Filter::by("id", 2)).await.unwrap();
        }
        assert_eq!(store.snapshot().await, before);
        assert_eq!(store.commit_count().await, 1);
    }

    #[tokio::test]
    async fn finished_transactions_reject_further_work() {
        let store = seeded_store().await;
        let mut tx = store.begin().await.unwrap();
        tx.commit().await.unwrap();

        assert!(matches!(
            tx.select("identity", &Filter::all()).await,
            Err(StorageError::InvariantViolation(_))
        ));
        assert!(tx.commit().await.is_err());
    }

    #[tokio::test]
    async fn writes_are_type_checked() {
        let store = seeded_store().await;
        let mut tx = store.begin().await.unwrap();
        let err = tx
            .insert(
                "membership",
                Row::new().with("subject_id", "one").with("record_type", "INVITE"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));

        let err = tx
            .insert("membership", Row::new().with("subject_id", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));
    }
}
