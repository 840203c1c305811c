//! The account-session capability interface.
//!
//! One [`AccountSession`] wraps one logged-in identity. It is a pure
//! capability wrapper: every method is a single remote operation, every
//! failure is a [`ProviderError`] kind, and all retry/backoff decisions
//! belong to the caller. The only pacing the session performs itself is the
//! small jittered delay between member-list pages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::{GroupAccess, ProviderError};
use crate::store::Account;

/// Upper bound the provider enforces on one participants page.
pub const MEMBER_PAGE_SIZE: i32 = 100;

/// One entry of an account's dialog list.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub chat_id: i64,
    pub title: String,
    pub username: Option<String>,
    /// Member count when the provider reports one.
    pub member_count: Option<i64>,
    /// Supergroups can be scraped and invited into; channels cannot.
    pub megagroup: bool,
}

impl Dialog {
    /// Whether this dialog can serve as a target: a public supergroup every
    /// worker account can reach by `t.me/<username>` link.
    #[must_use]
    pub fn invitable_by_link(&self) -> Option<String> {
        if !self.megagroup {
            return None;
        }
        self.username
            .as_ref()
            .map(|username| format!("https://t.me/{username}"))
    }
}

/// Handle to a joined group, sufficient for follow-up calls.
#[derive(Debug, Clone)]
pub struct GroupChat {
    pub chat_id: i64,
    pub access_hash: i64,
    pub title: String,
}

/// Last-seen status of a scraped member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastSeen {
    Online,
    Recently,
    LastWeek,
    LastMonth,
    /// Exact last-online timestamp.
    At(DateTime<Utc>),
    /// Status withheld by privacy settings.
    Hidden,
}

/// One scraped group member.
#[derive(Debug, Clone)]
pub struct Member {
    pub user_id: i64,
    pub access_hash: Option<i64>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub bot: bool,
    pub deleted: bool,
    pub scam: bool,
    pub fake: bool,
    pub last_seen: LastSeen,
}

/// One page of a paginated member listing.
#[derive(Debug, Clone)]
pub struct MemberPage {
    pub members: Vec<Member>,
    /// Total participant count reported alongside the page.
    pub total: i64,
}

impl MemberPage {
    /// Whether pagination has run past the end.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.members.is_empty()
    }
}

/// A parsed group invite link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteLink {
    /// `t.me/+hash` or `t.me/joinchat/hash`.
    Private { hash: String },
    /// `t.me/username` or `@username`.
    Public { username: String },
}

impl InviteLink {
    /// Parses the invite-link forms Telegram hands out.
    ///
    /// # Errors
    ///
    /// Returns `GroupInaccessible(InvalidLink)` when the link has no usable
    /// hash or username.
    pub fn parse(link: &str) -> Result<Self, ProviderError> {
        let trimmed = link.trim();
        let rest = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed);
        let rest = rest
            .strip_prefix("t.me/")
            .or_else(|| rest.strip_prefix("telegram.me/"))
            .or_else(|| rest.strip_prefix("telegram.dog/"))
            .unwrap_or(rest);

        let path = rest.split(['?', '#']).next().unwrap_or_default();

        if let Some(hash) = path.strip_prefix('+').or_else(|| path.strip_prefix("joinchat/")) {
            let hash = hash.trim_end_matches('/');
            if hash.is_empty() {
                return Err(ProviderError::GroupInaccessible(GroupAccess::InvalidLink));
            }
            return Ok(Self::Private {
                hash: hash.to_owned(),
            });
        }

        let username = path.strip_prefix('@').unwrap_or(path).trim_end_matches('/');
        if username.is_empty() || username.contains('/') {
            return Err(ProviderError::GroupInaccessible(GroupAccess::InvalidLink));
        }
        Ok(Self::Public {
            username: username.to_owned(),
        })
    }
}

/// Connection lifecycle and remote operations of one account.
///
/// Implementations hold whatever provider client they need internally;
/// nothing above this trait ever sees provider types.
#[async_trait]
pub trait AccountSession: Send + Sync {
    /// Whether the session is already signed in.
    async fn is_authorized(&self) -> Result<bool, ProviderError>;

    /// Asks the provider to deliver a login code to the account's phone.
    async fn send_login_code(&self) -> Result<(), ProviderError>;

    /// Completes login with a received code.
    async fn sign_in(&self, code: &str) -> Result<(), ProviderError>;

    /// Lists the account's dialogs (groups/channels it participates in).
    async fn list_dialogs(&self) -> Result<Vec<Dialog>, ProviderError>;

    /// Joins a group by invite link and returns a handle to it.
    async fn join_group(&self, link: &str) -> Result<GroupChat, ProviderError>;

    /// Fetches one page of a group's member list starting at `offset`.
    ///
    /// With `recent_only` the provider restricts the listing to recently
    /// active members. Pages after the first are preceded by the session's
    /// own jittered page delay.
    async fn list_members_page(
        &self,
        group: &GroupChat,
        offset: i32,
        recent_only: bool,
    ) -> Result<MemberPage, ProviderError>;

    /// Invites one member into `target`.
    async fn invite_member(&self, target: &GroupChat, member: &Member)
    -> Result<(), ProviderError>;

    /// Disconnects, returning the serialized session when `persist_session`
    /// is set so the caller can store it for the next login-free connect.
    async fn disconnect(&self, persist_session: bool) -> Result<Option<String>, ProviderError>;
}

/// Builds connected sessions for accounts; the orchestrator's only way to
/// reach the provider.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, account: &Account) -> Result<Box<dyn AccountSession>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_private_links() {
        assert_eq!(
            InviteLink::parse("https://t.me/+AbCdEf123").unwrap(),
            InviteLink::Private {
                hash: "AbCdEf123".to_owned()
            }
        );
        assert_eq!(
            InviteLink::parse("t.me/joinchat/AbCdEf123").unwrap(),
            InviteLink::Private {
                hash: "AbCdEf123".to_owned()
            }
        );
    }

    #[test]
    fn test_parse_public_links() {
        assert_eq!(
            InviteLink::parse("https://t.me/some_group").unwrap(),
            InviteLink::Public {
                username: "some_group".to_owned()
            }
        );
        assert_eq!(
            InviteLink::parse("@some_group").unwrap(),
            InviteLink::Public {
                username: "some_group".to_owned()
            }
        );
        assert_eq!(
            InviteLink::parse("some_group").unwrap(),
            InviteLink::Public {
                username: "some_group".to_owned()
            }
        );
    }

    #[test]
    fn test_parse_strips_query_parts() {
        assert_eq!(
            InviteLink::parse("https://t.me/some_group?start=1").unwrap(),
            InviteLink::Public {
                username: "some_group".to_owned()
            }
        );
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(matches!(
            InviteLink::parse("https://t.me/+"),
            Err(ProviderError::GroupInaccessible(GroupAccess::InvalidLink))
        ));
        assert!(matches!(
            InviteLink::parse(""),
            Err(ProviderError::GroupInaccessible(GroupAccess::InvalidLink))
        ));
    }
}
