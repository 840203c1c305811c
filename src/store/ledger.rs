//! The persistence interface consumed by the orchestrator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{Account, Group, GroupRole, NewAccount};

/// Storage errors. These are fatal for a run; the orchestrator never
/// retries a failed ledger operation.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupted record: {0}")]
    Corrupted(String),
}

/// Durable account/group store.
///
/// Operations are simple reads and single-row updates; all run logic lives
/// in the scheduler. The store is the single source of truth for account and
/// group eligibility, so workers re-read records right before consuming them
/// instead of caching eligibility decisions.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Accounts usable for a run: authenticated, not deactivated, and either
    /// holding quota or past (or never given) a quota window. Replenishment
    /// itself is the caller's job via [`Ledger::update_quota`].
    async fn list_eligible_accounts(&self, now: DateTime<Utc>) -> Result<Vec<Account>, LedgerError>;

    async fn get_account(&self, id: i64) -> Result<Option<Account>, LedgerError>;

    async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError>;

    async fn add_account(&self, account: NewAccount) -> Result<Account, LedgerError>;

    /// Administrative removal; never called by the core.
    async fn delete_account(&self, id: i64) -> Result<(), LedgerError>;

    async fn decrement_invite_quota(&self, id: i64, n: i64) -> Result<(), LedgerError>;

    /// Zeroes the quota and stores when it replenishes.
    async fn exhaust_quota(&self, id: i64, reset_at: DateTime<Utc>) -> Result<(), LedgerError>;

    /// Overwrites both quota fields, used for lazy replenishment on pull.
    async fn update_quota(
        &self,
        id: i64,
        invites_remaining: i64,
        quota_reset_at: Option<DateTime<Utc>>,
    ) -> Result<(), LedgerError>;

    async fn mark_deactivated(&self, id: i64, reason: &str) -> Result<(), LedgerError>;

    async fn mark_unauthenticated(&self, id: i64, reason: &str) -> Result<(), LedgerError>;

    async fn save_session(&self, id: i64, blob: &str) -> Result<(), LedgerError>;

    async fn list_enabled_source_groups(&self) -> Result<Vec<Group>, LedgerError>;

    /// The single group currently holding the target role.
    async fn get_target_group(&self) -> Result<Option<Group>, LedgerError>;

    async fn list_groups(&self) -> Result<Vec<Group>, LedgerError>;

    async fn add_group(
        &self,
        link: &str,
        name: Option<&str>,
        role: GroupRole,
    ) -> Result<Group, LedgerError>;

    /// Administrative removal; never called by the core.
    async fn delete_group(&self, id: i64) -> Result<(), LedgerError>;

    /// Promotes a group to target, demoting any previous target to source.
    async fn set_target_group(&self, id: i64) -> Result<(), LedgerError>;

    async fn set_group_enabled(&self, id: i64, enabled: bool) -> Result<(), LedgerError>;

    /// Permanently excludes a source group from future runs.
    async fn disable_group(&self, id: i64, reason: &str) -> Result<(), LedgerError>;

    async fn update_member_count(&self, id: i64, count: i64) -> Result<(), LedgerError>;

    async fn update_group_name(&self, id: i64, name: &str) -> Result<(), LedgerError>;
}
