use conclave_ledger::LedgerError;
use conclave_storage::StorageError;
use conclave_types::IdentityId;
use thiserror::Error;

pub type MergeResult<T> = Result<T, MergeError>;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("an identity cannot be merged into itself ({0})")]
    SelfMerge(IdentityId),

    #[error("identity {0} not found")]
    IdentityNotFound(IdentityId),

    #[error("identity {0} has already been merged")]
    AlreadyMerged(IdentityId),

    /// A migration hook refused the merge. Aborts the whole transaction.
    #[error("merge vetoed by {entity}: {reason}")]
    Veto { entity: String, reason: String },

    #[error("entity {0} is already registered")]
    DuplicateRegistration(String),

    #[error("table {0} is not in the schema catalog")]
    UnknownTable(String),

    #[error("tombstone chain from {public_id} exceeds {max_depth} links")]
    TombstoneChainTooLong { public_id: String, max_depth: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl MergeError {
    pub fn veto(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Veto {
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}
