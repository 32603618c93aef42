//! Conclave storage contract.
//!
//! This crate defines what identity consolidation needs from the relational
//! store that hosts the platform:
//! - a transaction surface (select/insert/update/delete, commit/rollback)
//! - an enumerable schema catalog with foreign keys and uniqueness constraints
//!
//! Design stance:
//! - The store owns atomicity and constraint enforcement.
//! - Consolidation logic only ever talks to `Store` and `Transaction`.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod catalog;
mod error;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use catalog::{
    ColumnDef, ColumnType, ForeignKey, SchemaCatalog, TableDescriptor, UniqueConstraint,
    DEFAULT_PARTITION, PRIMARY_KEY_CONSTRAINT,
};
pub use error::{StorageError, StorageResult};
pub use model::{Clause, Filter, Predicate, Row, Value};
pub use traits::{Store, Transaction};
