//! Persistent account and group records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One automatable Telegram identity.
///
/// Credentials and the serialized session blob let a worker re-establish an
/// authenticated connection without a fresh login. Quota fields are mutated
/// by the orchestrator as invites succeed or exhaust.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,

    /// Telegram API ID for this identity (obtain from <https://my.telegram.org>).
    pub api_id: i32,

    /// Telegram API hash paired with `api_id`.
    pub api_hash: String,

    /// Phone number in international format; unique per account.
    pub phone: String,

    /// Display name, for logs and the front end.
    pub name: String,

    /// Opaque serialized session, `None` until the first successful login.
    pub session_blob: Option<String>,

    /// Invites left in the current quota window.
    pub invites_remaining: i64,

    /// When the quota replenishes. `None` while the account is not exhausted
    /// (fresh accounts replenish on first pull).
    pub quota_reset_at: Option<DateTime<Utc>>,

    /// Cleared once login fails or the session is invalidated.
    pub authenticated: bool,

    /// Set once the provider reports the identity banned or deactivated.
    pub deactivated: bool,

    /// Last error/status note.
    pub details: Option<String>,
}

impl Account {
    /// Whether the account may be considered for work at all.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.authenticated && !self.deactivated
    }

    /// Whether the quota window has elapsed (or never started).
    #[must_use]
    pub fn quota_window_passed(&self, now: DateTime<Utc>) -> bool {
        self.quota_reset_at.is_none_or(|at| at <= now)
    }
}

/// Insertion payload for [`Account`]; also the bulk-import JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAccount {
    pub api_id: i32,
    pub api_hash: String,
    pub phone: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub session_blob: Option<String>,
}

/// Which side of a run a group sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    /// Scraped for members.
    Source,
    /// Receives the invited members; exactly one at a time.
    Target,
}

impl GroupRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Target => "target",
        }
    }
}

impl std::fmt::Display for GroupRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider-side group/channel known to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,

    /// Invite link (`t.me/+hash` or `t.me/username`).
    pub link: String,

    /// Display name, learned on first join.
    pub name: Option<String>,

    pub role: GroupRole,

    /// Cleared by the core when the group becomes permanently inaccessible.
    pub enabled: bool,

    /// Cached member count, refreshed after each scrape pass.
    pub member_count: i64,

    /// Last error/status note.
    pub details: Option<String>,
}

impl Group {
    /// Name for display, falling back to the link.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn account() -> Account {
        Account {
            id: 1,
            api_id: 12345,
            api_hash: "hash".to_owned(),
            phone: "+1234567890".to_owned(),
            name: "test".to_owned(),
            session_blob: None,
            invites_remaining: 0,
            quota_reset_at: None,
            authenticated: true,
            deactivated: false,
            details: None,
        }
    }

    #[test]
    fn test_fresh_account_window_passed() {
        let acc = account();
        assert!(acc.quota_window_passed(Utc::now()));
    }

    #[test]
    fn test_future_reset_window_not_passed() {
        let mut acc = account();
        let now = Utc::now();
        acc.quota_reset_at = Some(now + TimeDelta::hours(3));
        assert!(!acc.quota_window_passed(now));
        assert!(acc.quota_window_passed(now + TimeDelta::hours(4)));
    }

    #[test]
    fn test_usability_flags() {
        let mut acc = account();
        assert!(acc.is_usable());
        acc.deactivated = true;
        assert!(!acc.is_usable());
        acc.deactivated = false;
        acc.authenticated = false;
        assert!(!acc.is_usable());
    }

    #[test]
    fn test_group_display_name_falls_back_to_link() {
        let group = Group {
            id: 1,
            link: "https://t.me/+abc".to_owned(),
            name: None,
            role: GroupRole::Source,
            enabled: true,
            member_count: 0,
            details: None,
        };
        assert_eq!(group.display_name(), "https://t.me/+abc");
    }
}
