//! Provider error taxonomy.
//!
//! Telegram reports failures as RPC error names inside the invocation error
//! text. Workers never match on raw provider errors; everything is mapped to
//! one of these kinds first and policy decisions key off the kind.

use grammers_client::InvocationError;
use thiserror::Error;

/// Why a group cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAccess {
    /// Channel/group is private for this account.
    Private,
    /// Invite link malformed, expired or pointing nowhere.
    InvalidLink,
    /// Joining or listing members needs admin rights here.
    AdminRequired,
}

impl std::fmt::Display for GroupAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Private => "group is private",
            Self::InvalidLink => "invite link is invalid or expired",
            Self::AdminRequired => "admin rights required",
        };
        f.write_str(text)
    }
}

/// Why one specific user cannot be invited by this account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteRefusal {
    PrivacyRestricted,
    NotMutualContact,
    Deactivated,
    Blocked,
    AlreadyParticipant,
    TooManyChannels,
    Kicked,
}

impl std::fmt::Display for InviteRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::PrivacyRestricted => "privacy settings forbid invites",
            Self::NotMutualContact => "not a mutual contact",
            Self::Deactivated => "user is deactivated",
            Self::Blocked => "user blocked this account",
            Self::AlreadyParticipant => "already a participant",
            Self::TooManyChannels => "user is in too many channels",
            Self::Kicked => "user was kicked from the group",
        };
        f.write_str(text)
    }
}

/// Errors surfaced by the account-session provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API id or hash rejected")]
    InvalidCredentials,

    #[error("Phone number is banned")]
    PhoneBanned,

    #[error("Account is deactivated")]
    AccountDeactivated,

    #[error("Not authorized. Sign in first.")]
    NotAuthorized,

    #[error("Flood wait required: {0} seconds")]
    FloodWait(u32),

    #[error("Peer flood: provider suspects abuse")]
    PeerFlood,

    #[error("Login code is invalid")]
    CodeInvalid,

    #[error("Login code has expired")]
    CodeExpired,

    #[error("Two-factor password required")]
    PasswordRequired,

    #[error("Group inaccessible: {0}")]
    GroupInaccessible(GroupAccess),

    #[error("Writing to the chat is forbidden")]
    WriteForbidden,

    #[error("Account is banned from channel actions")]
    BannedInChannels,

    #[error("User cannot be invited: {0}")]
    UserNotInvitable(InviteRefusal),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("API invocation error: {0}")]
    Rpc(String),
}

impl ProviderError {
    /// Errors that permanently retire the account itself.
    #[must_use]
    pub fn is_account_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials | Self::PhoneBanned | Self::AccountDeactivated
        )
    }

    /// Group errors that no retry by the same account can fix.
    #[must_use]
    pub fn is_permanent_group_error(&self) -> bool {
        matches!(self, Self::GroupInaccessible(_))
    }
}

impl From<InvocationError> for ProviderError {
    fn from(err: InvocationError) -> Self {
        classify(&err.to_string())
    }
}

/// Maps a provider error string onto the taxonomy.
fn classify(err_str: &str) -> ProviderError {
    // FLOOD_WAIT carries its duration in the name, so it goes first.
    if let Some(seconds) = extract_flood_wait_seconds(err_str) {
        return ProviderError::FloodWait(seconds);
    }
    if err_str.contains("PEER_FLOOD") {
        return ProviderError::PeerFlood;
    }

    if err_str.contains("API_ID_INVALID") || err_str.contains("API_ID_PUBLISHED_FLOOD") {
        return ProviderError::InvalidCredentials;
    }
    if err_str.contains("PHONE_NUMBER_BANNED") {
        return ProviderError::PhoneBanned;
    }
    // INPUT_USER_DEACTIVATED names the invitee, not this account, and
    // must win over the USER_DEACTIVATED substring it contains.
    if err_str.contains("INPUT_USER_DEACTIVATED") {
        return ProviderError::UserNotInvitable(InviteRefusal::Deactivated);
    }
    // Covers USER_DEACTIVATED and USER_DEACTIVATED_BAN.
    if err_str.contains("USER_DEACTIVATED") {
        return ProviderError::AccountDeactivated;
    }
    if err_str.contains("AUTH_KEY_UNREGISTERED")
        || err_str.contains("SESSION_REVOKED")
        || err_str.contains("SESSION_EXPIRED")
    {
        return ProviderError::NotAuthorized;
    }

    if err_str.contains("PHONE_CODE_INVALID") {
        return ProviderError::CodeInvalid;
    }
    if err_str.contains("PHONE_CODE_EXPIRED") {
        return ProviderError::CodeExpired;
    }
    if err_str.contains("SESSION_PASSWORD_NEEDED") {
        return ProviderError::PasswordRequired;
    }

    if err_str.contains("CHANNEL_PRIVATE") || err_str.contains("CHANNEL_INVALID") {
        return ProviderError::GroupInaccessible(GroupAccess::Private);
    }
    if err_str.contains("CHAT_ADMIN_REQUIRED") || err_str.contains("INVITE_REQUEST_SENT") {
        return ProviderError::GroupInaccessible(GroupAccess::AdminRequired);
    }
    // INVITE_HASH_EXPIRED / INVITE_HASH_INVALID
    if err_str.contains("INVITE_HASH")
        || err_str.contains("USERNAME_NOT_OCCUPIED")
        || err_str.contains("USERNAME_INVALID")
    {
        return ProviderError::GroupInaccessible(GroupAccess::InvalidLink);
    }

    if err_str.contains("CHAT_WRITE_FORBIDDEN") {
        return ProviderError::WriteForbidden;
    }
    if err_str.contains("USER_BANNED_IN_CHANNEL") {
        return ProviderError::BannedInChannels;
    }

    let refusals = [
        ("USER_PRIVACY_RESTRICTED", InviteRefusal::PrivacyRestricted),
        ("USER_NOT_MUTUAL_CONTACT", InviteRefusal::NotMutualContact),
        ("USER_BLOCKED", InviteRefusal::Blocked),
        ("USER_ALREADY_PARTICIPANT", InviteRefusal::AlreadyParticipant),
        ("USER_CHANNELS_TOO_MUCH", InviteRefusal::TooManyChannels),
        ("USER_KICKED", InviteRefusal::Kicked),
    ];
    for (needle, refusal) in refusals {
        if err_str.contains(needle) {
            return ProviderError::UserNotInvitable(refusal);
        }
    }

    ProviderError::Rpc(err_str.to_owned())
}

/// Extracts flood wait seconds from an error message.
fn extract_flood_wait_seconds(err_msg: &str) -> Option<u32> {
    let patterns = ["FLOOD_WAIT_", "flood wait "];

    for pattern in patterns {
        if let Some(idx) = err_msg.to_lowercase().find(&pattern.to_lowercase()) {
            let start = idx + pattern.len();
            let num_str: String = err_msg[start..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            if let Ok(seconds) = num_str.parse() {
                return Some(seconds);
            }
        }
    }
    None
}

/// Classifies an error string that did not come through `InvocationError`.
#[must_use]
pub fn classify_str(err_str: &str) -> ProviderError {
    classify(err_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_flood_wait() {
        assert_eq!(extract_flood_wait_seconds("FLOOD_WAIT_120"), Some(120));
        assert_eq!(extract_flood_wait_seconds("flood wait 60 seconds"), Some(60));
        assert_eq!(extract_flood_wait_seconds("some other error"), None);
    }

    #[test]
    fn test_classify_flood_wait() {
        match classify("rpc error 420: FLOOD_WAIT_33") {
            ProviderError::FloodWait(33) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_classify_peer_flood_not_flood_wait() {
        assert!(matches!(
            classify("rpc error 400: PEER_FLOOD"),
            ProviderError::PeerFlood
        ));
    }

    #[test]
    fn test_classify_group_errors() {
        assert!(matches!(
            classify("rpc error 400: CHANNEL_PRIVATE"),
            ProviderError::GroupInaccessible(GroupAccess::Private)
        ));
        assert!(matches!(
            classify("rpc error 400: INVITE_HASH_EXPIRED"),
            ProviderError::GroupInaccessible(GroupAccess::InvalidLink)
        ));
        assert!(matches!(
            classify("rpc error 400: CHAT_ADMIN_REQUIRED"),
            ProviderError::GroupInaccessible(GroupAccess::AdminRequired)
        ));
    }

    #[test]
    fn test_classify_user_refusals() {
        assert!(matches!(
            classify("rpc error 400: USER_PRIVACY_RESTRICTED"),
            ProviderError::UserNotInvitable(InviteRefusal::PrivacyRestricted)
        ));
        assert!(matches!(
            classify("rpc error 400: USER_NOT_MUTUAL_CONTACT"),
            ProviderError::UserNotInvitable(InviteRefusal::NotMutualContact)
        ));
    }

    #[test]
    fn test_deactivated_invitee_is_not_account_fatal() {
        let err = classify("rpc error 400: INPUT_USER_DEACTIVATED");
        assert!(matches!(
            err,
            ProviderError::UserNotInvitable(InviteRefusal::Deactivated)
        ));
        assert!(!err.is_account_fatal());
    }

    #[test]
    fn test_classify_account_fatal() {
        assert!(classify("rpc error 400: PHONE_NUMBER_BANNED").is_account_fatal());
        assert!(classify("rpc error 403: USER_DEACTIVATED_BAN").is_account_fatal());
        assert!(classify("rpc error 400: API_ID_INVALID").is_account_fatal());
        assert!(!classify("rpc error 400: PEER_FLOOD").is_account_fatal());
    }

    #[test]
    fn test_unknown_falls_through_to_rpc() {
        assert!(matches!(
            classify("rpc error 400: SOMETHING_ELSE"),
            ProviderError::Rpc(_)
        ));
    }
}
