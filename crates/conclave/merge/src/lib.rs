//! Conclave Merge - identity consolidation.
//!
//! Merging folds a duplicate account (the casualty) into the account that
//! absorbs it (the survivor) in one transaction. Every table in the store's
//! schema catalog that references the identity key is either repointed by the
//! [`GenericTableMigrator`] or handed to the [`MigrationHook`] its entity
//! registered. A table whose identity column takes part in a uniqueness
//! constraint, or which lives on another storage partition, cannot be
//! repointed blindly: without a hook it aborts the merge.
//!
//! A successful merge retires the casualty and leaves a [`Tombstone`] so that
//! its public id keeps resolving.
//!
//! [`Tombstone`]: conclave_types::Tombstone

#![deny(unsafe_code)]

mod config;
mod coordinator;
mod error;
pub mod hooks;
pub mod identity;
mod migrator;
pub mod policies;
mod tombstone;

pub use config::MergeConfig;
pub use coordinator::{AbortReason, MergeCoordinator, MergeOutcome, MergeReport};
pub use error::{MergeError, MergeResult};
pub use hooks::{EntityRegistration, HookRegistry, MigrationHook};
pub use migrator::{GenericTableMigrator, TableMigration, UnsafeReason};
pub use policies::{
    ConflictVetoHook, DiscardDuplicateHook, LedgerMembershipHook, SecondaryMembershipHook,
    SingletonMergeHook,
};
pub use tombstone::{resolve_public_id, tombstone_chain};
