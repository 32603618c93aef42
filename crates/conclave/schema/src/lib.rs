//! Conclave Schema - the event platform wired for identity consolidation.
//!
//! This crate declares the platform's identity-referencing tables, the two
//! membership ledgers (organizations and project crews), and the merge policy
//! each entity needs. [`Platform::in_memory`] assembles all of it over the
//! in-memory store for tests and local tooling.

#![deny(unsafe_code)]

mod config;
mod error;
mod registry;
pub mod tables;
pub mod telemetry;

pub use config::{LoggingConfig, PlatformConfig};
pub use error::{PlatformError, PlatformResult};
pub use registry::platform_registry;

use conclave_ledger::MembershipLedger;
use conclave_merge::MergeCoordinator;
use conclave_storage::memory::InMemoryStore;
use std::sync::Arc;
use tracing::info;

/// Create every platform table in `store`.
pub async fn install(store: &InMemoryStore, config: &PlatformConfig) -> PlatformResult<()> {
    let tables = tables::platform_tables(&config.merge);
    let count = tables.len();
    for table in tables {
        store.create_table(table).await?;
    }
    info!(tables = count, partition = store.partition(), "platform schema installed");
    Ok(())
}

/// A store with the platform schema, its merge coordinator and its ledgers.
pub struct Platform {
    pub store: InMemoryStore,
    pub coordinator: MergeCoordinator,
    pub organizations: MembershipLedger,
    pub project_crews: MembershipLedger,
}

impl Platform {
    pub async fn in_memory(config: PlatformConfig) -> PlatformResult<Self> {
        let store = InMemoryStore::new();
        install(&store, &config).await?;

        let registry = platform_registry(&config.merge)?;
        let organizations =
            MembershipLedger::new(tables::organization_membership(&config.merge));
        let project_crews =
            MembershipLedger::new(tables::project_crew_membership(&config.merge));
        let coordinator = MergeCoordinator::new(Arc::new(store.clone()), registry, config.merge)?;

        Ok(Self {
            store,
            coordinator,
            organizations,
            project_crews,
        })
    }
}
