use conclave_storage::StorageError;
use conclave_types::RecordType;
use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Membership ledger errors. The first four are expected, user-facing outcomes.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("membership {record_id} has already been withdrawn")]
    AlreadyRevoked { record_id: i64 },

    #[error("an active membership {record_id} already exists")]
    AlreadyActive { record_id: i64 },

    #[error("cannot {operation} a {record_type} membership record")]
    InvalidRecordType {
        operation: &'static str,
        record_type: RecordType,
    },

    #[error("{kind} memberships have no role column {field}")]
    InvalidField { kind: String, field: String },

    #[error("membership record {0} not found")]
    NotFound(i64),

    #[error("corrupt membership row: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
