//! Platform configuration file.

use crate::{PlatformError, PlatformResult};
use conclave_merge::MergeConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub merge: MergeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            with_target: true,
        }
    }
}

impl PlatformConfig {
    /// Load configuration from a TOML file, or defaults if it does not exist.
    pub fn load(path: impl AsRef<Path>) -> PlatformResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PlatformError::Config(format!("{}: {e}", path.display())))?;
        let config: PlatformConfig =
            toml::from_str(&contents).map_err(|e| PlatformError::Config(e.to_string()))?;
        config.merge.validate()?;
        Ok(config)
    }
}
