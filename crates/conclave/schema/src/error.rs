use conclave_ledger::LedgerError;
use conclave_merge::MergeError;
use conclave_storage::StorageError;
use thiserror::Error;

pub type PlatformResult<T> = Result<T, PlatformError>;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("telemetry error: {0}")]
    Telemetry(String),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
