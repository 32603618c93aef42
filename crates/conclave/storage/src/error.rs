use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by a store or one of its transactions.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("table {0} already exists")]
    TableExists(String),

    /// Two rows would share a value of a unique constraint or primary key.
    #[error("duplicate key violates unique constraint \"{constraint}\" on {table}")]
    UniqueViolation { table: String, constraint: String },

    /// A write left a foreign key pointing at no row.
    #[error("foreign key violation on {table}: {detail}")]
    ReferenceViolation { table: String, detail: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether the write was refused by a schema constraint.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            StorageError::UniqueViolation { .. } | StorageError::ReferenceViolation { .. }
        )
    }
}
