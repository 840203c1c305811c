//! Telegram integration module.
//!
//! Provides the provider error taxonomy, the account-session capability
//! interface, invite pacing, and the grammers-backed implementation.

mod client;
mod error;
mod rate_limiter;
mod session;

pub use client::{GrammersSession, TelegramConnector};
pub(crate) use client::mask_phone;
pub use error::{GroupAccess, InviteRefusal, ProviderError, classify_str};
pub use rate_limiter::RateLimiter;
pub use session::{
    AccountSession, Dialog, GroupChat, InviteLink, LastSeen, MEMBER_PAGE_SIZE, Member, MemberPage,
    SessionConnector,
};
