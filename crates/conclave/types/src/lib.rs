//! Conclave Types - shared vocabulary for identity consolidation
#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Primary key of an identity row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityId(pub i64);

impl IdentityId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for IdentityId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A principal referenced by foreign key from entity tables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    /// Stable identifier handed to other systems; survives in tombstones.
    pub public_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub status: IdentityStatus,
}

impl Identity {
    pub fn is_active(&self) -> bool {
        self.status == IdentityStatus::Active
    }

    /// Orders two identities by seniority: earlier creation first, then lower key.
    pub fn is_older_than(&self, other: &Identity) -> bool {
        (self.created_at, self.id) < (other.created_at, other.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Active,
    /// Retired by a merge; resolves to its survivor through a tombstone.
    Merged,
}

impl IdentityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityStatus::Active => "active",
            IdentityStatus::Merged => "merged",
        }
    }
}

impl fmt::Display for IdentityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(IdentityStatus::Active),
            "merged" => Ok(IdentityStatus::Merged),
            other => Err(ParseError::UnknownVariant {
                kind: "identity status",
                value: other.to_string(),
            }),
        }
    }
}

/// Permanent marker that a retired identity now resolves to a survivor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub retired_public_id: Uuid,
    pub survivor_id: IdentityId,
    pub merged_at: DateTime<Utc>,
}

/// Provenance tag on a membership row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    Invite,
    Accept,
    DirectAdd,
    Amend,
}

impl RecordType {
    pub const ALL: [RecordType; 4] = [
        RecordType::Invite,
        RecordType::Accept,
        RecordType::DirectAdd,
        RecordType::Amend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Invite => "INVITE",
            RecordType::Accept => "ACCEPT",
            RecordType::DirectAdd => "DIRECT_ADD",
            RecordType::Amend => "AMEND",
        }
    }

    /// Whether a caller may create a fresh row with this type.
    pub fn is_initial(&self) -> bool {
        matches!(self, RecordType::Invite | RecordType::DirectAdd)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordType::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == s)
            .ok_or_else(|| ParseError::UnknownVariant {
                kind: "record type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}
