//! Merge policy for each platform entity.

use crate::tables::{self, organization_membership, project_crew_membership};
use conclave_ledger::MembershipLedger;
use conclave_merge::{
    ConflictVetoHook, DiscardDuplicateHook, EntityRegistration, HookRegistry,
    LedgerMembershipHook, MergeConfig, MergeResult, SecondaryMembershipHook, SingletonMergeHook,
};

/// The registry every platform process builds once at start-up.
///
/// Tables not named here (comments, proposals, sessions, ...) are repointed
/// by the generic migrator.
pub fn platform_registry(config: &MergeConfig) -> MergeResult<HookRegistry> {
    HookRegistry::new()
        .with(
            EntityRegistration::new("auth_token", tables::AUTH_TOKEN).with_hook(
                SingletonMergeHook::new(tables::AUTH_TOKEN, "identity_id", "client_id")
                    .token_column("scope"),
            ),
        )?
        .with(
            EntityRegistration::new("comment_vote", tables::COMMENT_VOTE).with_hook(
                DiscardDuplicateHook::new(tables::COMMENT_VOTE, "voter_id")
                    .counterpart("comment_id")
                    .log_discarded(config.log_discarded_conflicts),
            ),
        )?
        .with(
            EntityRegistration::new("rsvp", tables::RSVP).with_hook(
                DiscardDuplicateHook::new(tables::RSVP, "attendee_id")
                    .counterpart("project_id")
                    .log_discarded(config.log_discarded_conflicts),
            ),
        )?
        .with(
            EntityRegistration::new("ticket_participant", tables::TICKET_PARTICIPANT).with_hook(
                ConflictVetoHook::new("ticket_participant", tables::TICKET_PARTICIPANT, "holder_id")
                    .counterpart("project_id"),
            ),
        )?
        .with(
            EntityRegistration::new("user_group", tables::USER_GROUP)
                .table(tables::USER_GROUP_MEMBERSHIP)
                .with_hook(
                    SecondaryMembershipHook::new(
                        tables::USER_GROUP,
                        tables::USER_GROUP_MEMBERSHIP,
                        "group_id",
                        "identity_id",
                    )
                    .owner_column("owner_id"),
                ),
        )?
        .with(
            EntityRegistration::new("organization_membership", tables::ORGANIZATION_MEMBERSHIP)
                .with_hook(LedgerMembershipHook::new(MembershipLedger::new(
                    organization_membership(config),
                ))),
        )?
        .with(
            EntityRegistration::new("project_crew_membership", tables::PROJECT_CREW_MEMBERSHIP)
                .with_hook(LedgerMembershipHook::new(MembershipLedger::new(
                    project_crew_membership(config),
                ))),
        )?
        .with(EntityRegistration::new("auth_client", tables::AUTH_CLIENT))
}
