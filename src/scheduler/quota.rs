//! Invite-quota and join-cadence policy.
//!
//! All decisions about how many invites an account may send and when a
//! group may be joined again are made here, against a settings snapshot
//! taken at run start. The ledger only stores the resulting numbers.

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

use crate::config::{INVITE_LIMIT_MAX, Settings};
use crate::store::Account;

/// Pure quota arithmetic for a single run.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    invite_limit: u32,
    invite_limit_spread: u32,
    limit_reset_days: u32,
    join_interval_secs: u64,
    join_jitter_secs: u64,
}

impl QuotaPolicy {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        let invite_limit = settings.invite_limit.min(INVITE_LIMIT_MAX);
        Self {
            invite_limit,
            invite_limit_spread: settings.invite_limit_spread.min(invite_limit),
            limit_reset_days: settings.limit_reset_days.max(1),
            join_interval_secs: settings.join_interval_secs,
            join_jitter_secs: settings.join_jitter_secs,
        }
    }

    /// Samples a fresh quota from the configured ceiling and spread.
    #[must_use]
    pub fn sample_quota(&self) -> i64 {
        let low = self.invite_limit.saturating_sub(self.invite_limit_spread);
        let quota = rand::rng().random_range(low..=self.invite_limit);
        i64::from(quota.min(INVITE_LIMIT_MAX))
    }

    /// Replenishes an exhausted account whose reset window has passed.
    ///
    /// Returns `true` when the account was changed and the new values
    /// should be written back to the ledger.
    pub fn refresh(&self, account: &mut Account, now: DateTime<Utc>) -> bool {
        if account.invites_remaining > 0 {
            return false;
        }
        if !account.quota_window_passed(now) {
            return false;
        }
        account.invites_remaining = self.sample_quota();
        account.quota_reset_at = None;
        true
    }

    /// Whether the account may send an invite right now, replenishing
    /// it first when its reset window has passed.
    pub fn can_invite(&self, account: &mut Account, now: DateTime<Utc>) -> bool {
        self.refresh(account, now);
        account.invites_remaining > 0
    }

    /// When a quota exhausted at `now` becomes eligible for replenishment.
    #[must_use]
    pub fn exhausted_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + TimeDelta::days(i64::from(self.limit_reset_days))
    }

    /// Earliest moment any account may join a group last joined at
    /// `joined_at`. Jitter keeps join times from forming a fixed beat.
    #[must_use]
    pub fn next_join_allowed_at(&self, joined_at: DateTime<Utc>) -> DateTime<Utc> {
        let jitter_secs = rand::rng().random_range(0..=self.join_jitter_secs);
        let wait = self.join_interval_secs.saturating_add(jitter_secs);
        joined_at + TimeDelta::seconds(i64::try_from(wait).unwrap_or(i64::MAX))
    }
}
