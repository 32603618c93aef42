//! Migration hook registry.
//!
//! Entity types whose generic foreign-key repointing would be wrong (duplicate
//! rows, cumulative fields, domain conflicts) register a [`MigrationHook`].
//! The registry is built once at process start and iterated in entity-name
//! order, so every merge visits entities in the same sequence.

use crate::{MergeError, MergeResult};
use async_trait::async_trait;
use conclave_storage::Transaction;
use conclave_types::Identity;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Domain-specific conflict resolution for one entity type.
///
/// Runs inside the merge transaction. Returns the names of every table the
/// hook fully handled; the coordinator skips those in its generic pass. An
/// `Err` (typically [`MergeError::Veto`]) aborts the whole merge.
#[async_trait]
pub trait MigrationHook: Send + Sync {
    async fn migrate_identity(
        &self,
        tx: &mut dyn Transaction,
        old: &Identity,
        new: &Identity,
    ) -> MergeResult<BTreeSet<String>>;
}

/// One entity type: its primary table, any further tables it owns, and an
/// optional hook.
#[derive(Clone)]
pub struct EntityRegistration {
    entity: String,
    primary_table: String,
    tables: Vec<String>,
    hook: Option<Arc<dyn MigrationHook>>,
}

impl EntityRegistration {
    pub fn new(entity: impl Into<String>, primary_table: impl Into<String>) -> Self {
        let primary_table = primary_table.into();
        Self {
            entity: entity.into(),
            tables: vec![primary_table.clone()],
            primary_table,
            hook: None,
        }
    }

    /// Declare another table owned by the entity.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        let table = table.into();
        if !self.tables.contains(&table) {
            self.tables.push(table);
        }
        self
    }

    pub fn with_hook(mut self, hook: impl MigrationHook + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn with_shared_hook(mut self, hook: Arc<dyn MigrationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn primary_table(&self) -> &str {
        &self.primary_table
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn hook(&self) -> Option<&Arc<dyn MigrationHook>> {
        self.hook.as_ref()
    }
}

impl fmt::Debug for EntityRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRegistration")
            .field("entity", &self.entity)
            .field("tables", &self.tables)
            .field("hooked", &self.hook.is_some())
            .finish()
    }
}

#[derive(Clone, Debug, Default)]
pub struct HookRegistry {
    entities: BTreeMap<String, EntityRegistration>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: EntityRegistration) -> MergeResult<()> {
        if self.entities.contains_key(registration.entity()) {
            return Err(MergeError::DuplicateRegistration(registration.entity));
        }
        self.entities
            .insert(registration.entity.clone(), registration);
        Ok(())
    }

    /// Builder form of [`HookRegistry::register`].
    pub fn with(mut self, registration: EntityRegistration) -> MergeResult<Self> {
        self.register(registration)?;
        Ok(self)
    }

    pub fn get(&self, entity: &str) -> Option<&EntityRegistration> {
        self.entities.get(entity)
    }

    /// Registrations in entity-name order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityRegistration> {
        self.entities.values()
    }

    /// Every table some registration declares.
    pub fn declared_tables(&self) -> BTreeSet<&str> {
        self.iter()
            .flat_map(|registration| registration.tables.iter().map(String::as_str))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl MigrationHook for Noop {
        async fn migrate_identity(
            &self,
            _tx: &mut dyn Transaction,
            _old: &Identity,
            _new: &Identity,
        ) -> MergeResult<BTreeSet<String>> {
            Ok(BTreeSet::new())
        }
    }

    #[test]
    fn test_registry_iterates_in_entity_order() {
        let registry = HookRegistry::new()
            .with(EntityRegistration::new("rsvp", "rsvp").with_hook(Noop))
            .unwrap()
            .with(EntityRegistration::new("comment", "comment").table("comment_vote"))
            .unwrap();

        let order: Vec<_> = registry.iter().map(EntityRegistration::entity).collect();
        assert_eq!(order, vec!["comment", "rsvp"]);
        assert!(registry.get("rsvp").unwrap().hook().is_some());
        assert!(registry.get("comment").unwrap().hook().is_none());
        assert_eq!(
            registry.declared_tables(),
            BTreeSet::from(["comment", "comment_vote", "rsvp"])
        );
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = HookRegistry::new();
        registry
            .register(EntityRegistration::new("rsvp", "rsvp"))
            .unwrap();
        let err = registry
            .register(EntityRegistration::new("rsvp", "rsvp_v2").with_hook(Noop))
            .unwrap_err();
        assert!(matches!(err, MergeError::DuplicateRegistration(name) if name == "rsvp"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_tables_are_deduplicated() {
        let registration = EntityRegistration::new("group", "user_group")
            .table("user_group_membership")
            .table("user_group");
        assert_eq!(registration.tables(), ["user_group", "user_group_membership"]);
    }
}
