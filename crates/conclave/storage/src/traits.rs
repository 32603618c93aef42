use crate::catalog::SchemaCatalog;
use crate::model::{Filter, Row};
use crate::StorageResult;
use async_trait::async_trait;

/// One open storage transaction.
///
/// Nothing written through a transaction is visible to other transactions
/// until `commit`. Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait Transaction: Send {
    /// Partition this transaction's atomicity covers.
    fn partition(&self) -> &str;

    /// Rows of `table` matching `filter`, in storage order.
    async fn select(&mut self, table: &str, filter: &Filter) -> StorageResult<Vec<Row>>;

    /// Insert a row and return it as stored, generated key included.
    async fn insert(&mut self, table: &str, row: Row) -> StorageResult<Row>;

    /// Apply `changes` to every row matching `filter`; returns the row count.
    async fn update(&mut self, table: &str, filter: &Filter, changes: &Row) -> StorageResult<u64>;

    /// Delete every row matching `filter`; returns the row count.
    async fn delete(&mut self, table: &str, filter: &Filter) -> StorageResult<u64>;

    /// Make every write of this transaction visible. The transaction is
    /// finished afterwards and further calls fail.
    async fn commit(&mut self) -> StorageResult<()>;

    /// Discard every write of this transaction and finish it.
    async fn rollback(&mut self) -> StorageResult<()>;
}

/// A transactional relational store with constraint introspection.
#[async_trait]
pub trait Store: Send + Sync {
    /// Introspect the tables currently hosted by the store.
    async fn catalog(&self) -> StorageResult<SchemaCatalog>;

    /// Open a transaction over the store's own partition.
    async fn begin(&self) -> StorageResult<Box<dyn Transaction>>;
}

/// Convenience reads layered on any transaction.
impl dyn Transaction + '_ {
    /// The only row matching `filter`, if any. More than one match is an error.
    pub async fn select_one(&mut self, table: &str, filter: &Filter) -> StorageResult<Option<Row>> {
        let mut rows = self.select(table, filter).await?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            n => Err(crate::StorageError::InvariantViolation(format!(
                "expected at most one row in {table}, found {n}"
            ))),
        }
    }

    /// Whether any row of `table` matches `filter`.
    pub async fn exists(&mut self, table: &str, filter: &Filter) -> StorageResult<bool> {
        Ok(!self.select(table, filter).await?.is_empty())
    }
}
