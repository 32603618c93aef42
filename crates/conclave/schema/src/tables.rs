//! Entity tables of the event platform that reference identities.

use conclave_ledger::MembershipKind;
use conclave_merge::identity::{identity_descriptor, tombstone_descriptor};
use conclave_merge::MergeConfig;
use conclave_storage::{ColumnType, TableDescriptor};

pub const ORGANIZATION: &str = "organization";
pub const ORGANIZATION_MEMBERSHIP: &str = "organization_membership";
pub const PROJECT: &str = "project";
pub const PROJECT_CREW_MEMBERSHIP: &str = "project_crew_membership";
pub const PROPOSAL: &str = "proposal";
pub const COMMENT: &str = "comment";
pub const COMMENT_VOTE: &str = "comment_vote";
pub const RSVP: &str = "rsvp";
pub const TICKET_PARTICIPANT: &str = "ticket_participant";
pub const AUTH_CLIENT: &str = "auth_client";
pub const AUTH_TOKEN: &str = "auth_token";
pub const USER_GROUP: &str = "user_group";
pub const USER_GROUP_MEMBERSHIP: &str = "user_group_membership";
pub const EMAIL_ADDRESS: &str = "email_address";
pub const LOGIN_SESSION: &str = "login_session";

pub fn organization_membership(config: &MergeConfig) -> MembershipKind {
    MembershipKind::new("organization", ORGANIZATION_MEMBERSHIP, ORGANIZATION, "organization_id")
        .with_identity_table(config.identity_table.clone(), config.identity_key.clone())
        .role("is_owner", "owner")
        .role("is_admin", "admin")
}

pub fn project_crew_membership(config: &MergeConfig) -> MembershipKind {
    MembershipKind::new("project_crew", PROJECT_CREW_MEMBERSHIP, PROJECT, "project_id")
        .with_identity_table(config.identity_table.clone(), config.identity_key.clone())
        .role("is_editor", "editor")
        .role("is_promoter", "promoter")
        .role("is_usher", "usher")
}

/// Every platform table, in an order where foreign-key targets come first.
pub fn platform_tables(config: &MergeConfig) -> Vec<TableDescriptor> {
    let identity = config.identity_table.as_str();
    let key = config.identity_key.as_str();

    vec![
        identity_descriptor(config),
        tombstone_descriptor(config),
        TableDescriptor::new(ORGANIZATION)
            .with_id()
            .column("name", ColumnType::Text)
            .nullable("created_by_id", ColumnType::Int)
            .references("created_by_id", identity, key),
        organization_membership(config).descriptor(),
        TableDescriptor::new(PROJECT)
            .with_id()
            .column("organization_id", ColumnType::Int)
            .column("title", ColumnType::Text)
            .references("organization_id", ORGANIZATION, "id"),
        project_crew_membership(config).descriptor(),
        TableDescriptor::new(PROPOSAL)
            .with_id()
            .column("project_id", ColumnType::Int)
            .column("speaker_id", ColumnType::Int)
            .column("title", ColumnType::Text)
            .references("project_id", PROJECT, "id")
            .references("speaker_id", identity, key),
        TableDescriptor::new(COMMENT)
            .with_id()
            .column("proposal_id", ColumnType::Int)
            .column("author_id", ColumnType::Int)
            .column("body", ColumnType::Text)
            .nullable("edited_by_id", ColumnType::Int)
            .references("proposal_id", PROPOSAL, "id")
            .references("author_id", identity, key)
            .references("edited_by_id", identity, key),
        TableDescriptor::new(COMMENT_VOTE)
            .with_id()
            .column("comment_id", ColumnType::Int)
            .column("voter_id", ColumnType::Int)
            .column("score", ColumnType::Int)
            .references("comment_id", COMMENT, "id")
            .references("voter_id", identity, key)
            .unique("comment_vote_voter_key", &["voter_id", "comment_id"]),
        TableDescriptor::new(RSVP)
            .with_id()
            .column("project_id", ColumnType::Int)
            .column("attendee_id", ColumnType::Int)
            .column("response", ColumnType::Text)
            .references("project_id", PROJECT, "id")
            .references("attendee_id", identity, key)
            .unique("rsvp_attendee_key", &["attendee_id", "project_id"]),
        TableDescriptor::new(TICKET_PARTICIPANT)
            .with_id()
            .column("project_id", ColumnType::Int)
            .column("holder_id", ColumnType::Int)
            .column("ticket_code", ColumnType::Text)
            .references("project_id", PROJECT, "id")
            .references("holder_id", identity, key)
            .unique("ticket_participant_holder_key", &["holder_id", "project_id"]),
        TableDescriptor::new(AUTH_CLIENT)
            .with_id()
            .column("name", ColumnType::Text)
            .nullable("owner_id", ColumnType::Int)
            .references("owner_id", identity, key),
        TableDescriptor::new(AUTH_TOKEN)
            .with_id()
            .column("client_id", ColumnType::Int)
            .column("identity_id", ColumnType::Int)
            .column("scope", ColumnType::Text)
            .references("client_id", AUTH_CLIENT, "id")
            .references("identity_id", identity, key)
            .unique("auth_token_identity_client_key", &["identity_id", "client_id"]),
        TableDescriptor::new(USER_GROUP)
            .with_id()
            .column("name", ColumnType::Text)
            .nullable("owner_id", ColumnType::Int)
            .references("owner_id", identity, key),
        TableDescriptor::new(USER_GROUP_MEMBERSHIP)
            .column("group_id", ColumnType::Int)
            .column("identity_id", ColumnType::Int)
            .primary_key(&["group_id", "identity_id"])
            .references("group_id", USER_GROUP, "id")
            .references("identity_id", identity, key),
        TableDescriptor::new(EMAIL_ADDRESS)
            .with_id()
            .column("identity_id", ColumnType::Int)
            .column("address", ColumnType::Text)
            .column("verified", ColumnType::Bool)
            .references("identity_id", identity, key)
            .unique("email_address_key", &["address"]),
        TableDescriptor::new(LOGIN_SESSION)
            .with_id()
            .column("identity_id", ColumnType::Int)
            .column("started_at", ColumnType::Timestamp)
            .references("identity_id", identity, key),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_merge::GenericTableMigrator;
    use conclave_storage::DEFAULT_PARTITION;

    #[test]
    fn test_tables_validate_and_names_are_unique() {
        let tables = platform_tables(&MergeConfig::default());
        let mut names: Vec<_> = tables.iter().map(|t| t.name.as_str()).collect();
        for table in &tables {
            table.validate().unwrap();
        }
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), tables.len());
    }

    #[test]
    fn test_generically_unsafe_tables_are_the_hooked_ones() {
        let config = MergeConfig::default();
        let migrator = GenericTableMigrator::new(&config);
        let unsafe_tables: Vec<_> = platform_tables(&config)
            .iter()
            .filter(|t| !config.is_reserved(&t.name))
            .filter(|t| migrator.assess(t, DEFAULT_PARTITION).is_some())
            .map(|t| t.name.clone())
            .collect();

        assert_eq!(
            unsafe_tables,
            vec![
                ORGANIZATION_MEMBERSHIP,
                PROJECT_CREW_MEMBERSHIP,
                COMMENT_VOTE,
                RSVP,
                TICKET_PARTICIPANT,
                AUTH_TOKEN,
                USER_GROUP_MEMBERSHIP,
            ]
        );
    }
}
