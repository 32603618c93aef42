//! Merge configuration.

use crate::{MergeError, MergeResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Where identities and tombstones live, and which tables the walk skips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub identity_table: String,
    pub identity_key: String,
    pub tombstone_table: String,
    /// Tables never walked by the generic pass, e.g. audit logs that must keep
    /// pointing at the retired identity.
    pub excluded_tables: BTreeSet<String>,
    pub max_tombstone_depth: usize,
    pub log_discarded_conflicts: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            identity_table: "identity".to_string(),
            identity_key: "id".to_string(),
            tombstone_table: "identity_tombstone".to_string(),
            excluded_tables: BTreeSet::new(),
            max_tombstone_depth: 32,
            log_discarded_conflicts: true,
        }
    }
}

impl MergeConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> MergeResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| MergeError::Config(format!("{}: {e}", path.display())))?;
        let config: Self = toml::from_str(&contents).map_err(|e| MergeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MergeResult<()> {
        if self.identity_table.is_empty() || self.identity_key.is_empty() {
            return Err(MergeError::Config("identity table and key must be set".into()));
        }
        if self.tombstone_table.is_empty() {
            return Err(MergeError::Config("tombstone table must be set".into()));
        }
        if self.max_tombstone_depth == 0 {
            return Err(MergeError::Config("max_tombstone_depth must be positive".into()));
        }
        Ok(())
    }

    /// Tables the coordinator never hands to a migrator.
    pub fn is_reserved(&self, table: &str) -> bool {
        table == self.identity_table
            || table == self.tombstone_table
            || self.excluded_tables.contains(table)
    }

    pub fn exclude(mut self, table: impl Into<String>) -> Self {
        self.excluded_tables.insert(table.into());
        self
    }
}
