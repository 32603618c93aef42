//! Tracing bootstrap for processes hosting the platform.

use crate::config::LoggingConfig;
use crate::{PlatformError, PlatformResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides `config.level`.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> PlatformResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| PlatformError::Telemetry(e.to_string()))?;

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        subscriber
            .with(fmt::layer().json().with_target(config.with_target))
            .try_init()
    } else {
        subscriber
            .with(fmt::layer().with_target(config.with_target))
            .try_init()
    };
    installed.map_err(|e| PlatformError::Telemetry(e.to_string()))
}
