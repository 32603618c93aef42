//! Conclave Ledger - immutable membership records.
//!
//! A membership row states that a subject identity holds a set of role flags
//! on a parent entity from `granted_at` until `revoked_at`. Rows are never
//! edited in place: every change revokes the current row and inserts a
//! successor that points back at it through `supersedes_id`. History is never
//! deleted.
//!
//! At most one row per (parent, subject) is active (not revoked and not an
//! invite). The store enforces that with a partial unique constraint that
//! [`MembershipKind::descriptor`] declares, so concurrent grants collide in
//! storage instead of silently double-activating.

#![deny(unsafe_code)]

mod error;
mod kind;
mod ledger;
mod record;

pub use error::{LedgerError, LedgerResult};
pub use kind::{columns, MembershipKind, RoleColumn};
pub use ledger::MembershipLedger;
pub use record::{MembershipRecord, RoleFlags};
