//! Grammers-backed account sessions.
//!
//! Composition over the provider client: the adapter owns a `Client` plus
//! the sender-pool handle and exposes only the [`AccountSession`] surface.
//! Raw TL functions are invoked directly for everything the high-level
//! client does not cover (joins, participant pages, invites).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use grammers_client::client::LoginToken;
use grammers_client::{Client, SenderPool, SignInError, sender};
use grammers_session::storages::SqliteSession;
use grammers_tl_types as tl;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{GroupAccess, InviteRefusal, ProviderError, classify_str};
use super::session::{
    AccountSession, Dialog, GroupChat, InviteLink, LastSeen, MEMBER_PAGE_SIZE, Member, MemberPage,
    SessionConnector,
};
use crate::store::Account;

/// Builds [`GrammersSession`]s for ledger accounts.
///
/// Each account gets its own session file under `sessions_dir`, named by the
/// phone's digits, recreated from the ledger's session blob when missing.
#[derive(Debug, Clone)]
pub struct TelegramConnector {
    sessions_dir: PathBuf,
    page_delay_ms: (u64, u64),
}

impl TelegramConnector {
    #[must_use]
    pub fn new(sessions_dir: PathBuf, page_delay_ms: (u64, u64), proxy_url: Option<&str>) -> Self {
        if let Some(url) = proxy_url {
            // The sender pool connects directly; tunneling is not wired up.
            warn!("Proxy {url} configured but unsupported, connecting directly");
        }
        Self {
            sessions_dir,
            page_delay_ms,
        }
    }
}

#[async_trait]
impl SessionConnector for TelegramConnector {
    async fn connect(&self, account: &Account) -> Result<Box<dyn AccountSession>, ProviderError> {
        let session = GrammersSession::connect(account, &self.sessions_dir, self.page_delay_ms)
            .await?;
        Ok(Box::new(session))
    }
}

/// One logged-in (or logging-in) identity over grammers.
pub struct GrammersSession {
    /// The underlying grammers client.
    client: Client,

    /// Handle to the sender pool for disconnection.
    handle: sender::SenderPoolHandle,

    phone: String,
    api_hash: String,
    session_path: PathBuf,

    /// Token from the last login-code request.
    login_token: Mutex<Option<LoginToken>>,

    /// Delay range between member-list pages, in milliseconds.
    page_delay_ms: (u64, u64),

    /// Background task running the sender pool.
    _pool_task: JoinHandle<()>,
}

impl GrammersSession {
    /// Connects one account, restoring its session file from the ledger
    /// blob when the file is missing.
    async fn connect(
        account: &Account,
        sessions_dir: &std::path::Path,
        page_delay_ms: (u64, u64),
    ) -> Result<Self, ProviderError> {
        info!("Connecting account {}...", mask_phone(&account.phone));

        std::fs::create_dir_all(sessions_dir)
            .map_err(|e| ProviderError::Session(e.to_string()))?;
        let session_path = sessions_dir.join(format!("{}.session", phone_digits(&account.phone)));

        if !session_path.exists()
            && let Some(blob) = &account.session_blob
        {
            let bytes = BASE64
                .decode(blob)
                .map_err(|e| ProviderError::Session(format!("bad session blob: {e}")))?;
            std::fs::write(&session_path, bytes)
                .map_err(|e| ProviderError::Session(e.to_string()))?;
        }

        let session = Arc::new(
            SqliteSession::open(&session_path)
                .await
                .map_err(|e| ProviderError::Session(e.to_string()))?,
        );

        let SenderPool {
            runner,
            updates: _updates,
            handle,
        } = SenderPool::new(Arc::clone(&session), account.api_id);

        let client = Client::new(handle.clone());

        let pool_task = tokio::spawn(async move {
            runner.run().await;
        });

        let is_authorized = client
            .is_authorized()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        debug!(
            "Account {} connected, authorized: {}",
            mask_phone(&account.phone),
            is_authorized
        );

        Ok(Self {
            client,
            handle: handle.thin,
            phone: account.phone.clone(),
            api_hash: account.api_hash.clone(),
            session_path,
            login_token: Mutex::new(None),
            page_delay_ms,
            _pool_task: pool_task,
        })
    }

    fn input_channel(group: &GroupChat) -> tl::enums::InputChannel {
        tl::enums::InputChannel::Channel(tl::types::InputChannel {
            channel_id: group.chat_id,
            access_hash: group.access_hash,
        })
    }

    async fn join_private(&self, hash: &str) -> Result<GroupChat, ProviderError> {
        let request = tl::functions::messages::ImportChatInvite {
            hash: hash.to_owned(),
        };
        match self.client.invoke(&request).await {
            Ok(updates) => first_channel(chats_from_updates(updates)),
            Err(err) => match ProviderError::from(err) {
                // Already a member: look the chat up instead.
                ProviderError::UserNotInvitable(InviteRefusal::AlreadyParticipant) => {
                    let check = tl::functions::messages::CheckChatInvite {
                        hash: hash.to_owned(),
                    };
                    match self.client.invoke(&check).await.map_err(ProviderError::from)? {
                        tl::enums::ChatInvite::Already(already) => first_channel(vec![already.chat]),
                        tl::enums::ChatInvite::Peek(peek) => first_channel(vec![peek.chat]),
                        tl::enums::ChatInvite::Invite(_) => {
                            Err(ProviderError::GroupInaccessible(GroupAccess::Private))
                        }
                    }
                }
                other => Err(other),
            },
        }
    }

    async fn join_public(&self, username: &str) -> Result<GroupChat, ProviderError> {
        let resolve = tl::functions::contacts::ResolveUsername {
            username: username.to_owned(),
            referer: None,
        };
        let tl::enums::contacts::ResolvedPeer::ResolvedPeer(resolved) = self
            .client
            .invoke(&resolve)
            .await
            .map_err(ProviderError::from)?;

        let group = first_channel(resolved.chats)?;
        let request = tl::functions::channels::JoinChannel {
            channel: Self::input_channel(&group),
        };
        self.client
            .invoke(&request)
            .await
            .map_err(ProviderError::from)?;
        Ok(group)
    }

    async fn page_pause(&self) {
        let (min, max) = self.page_delay_ms;
        let delay = {
            let mut rng = rand::rng();
            rng.random_range(min..=max.max(min))
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

#[async_trait]
impl AccountSession for GrammersSession {
    async fn is_authorized(&self) -> Result<bool, ProviderError> {
        self.client
            .is_authorized()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))
    }

    async fn send_login_code(&self) -> Result<(), ProviderError> {
        info!("Requesting login code for {}...", mask_phone(&self.phone));

        let token = self
            .client
            .request_login_code(&self.phone, &self.api_hash)
            .await
            .map_err(|e| classify_str(&e.to_string()))?;

        *self.login_token.lock().await = Some(token);
        Ok(())
    }

    async fn sign_in(&self, code: &str) -> Result<(), ProviderError> {
        let guard = self.login_token.lock().await;
        let Some(token) = guard.as_ref() else {
            return Err(ProviderError::Session(
                "no login code was requested".to_owned(),
            ));
        };

        match self.client.sign_in(token, code).await {
            Ok(_user) => {
                info!("Account {} signed in", mask_phone(&self.phone));
                Ok(())
            }
            Err(SignInError::PasswordRequired(_token)) => Err(ProviderError::PasswordRequired),
            Err(SignInError::InvalidCode) => Err(ProviderError::CodeInvalid),
            Err(e) => Err(classify_str(&e.to_string())),
        }
    }

    async fn list_dialogs(&self) -> Result<Vec<Dialog>, ProviderError> {
        let request = tl::functions::messages::GetDialogs {
            exclude_pinned: false,
            folder_id: None,
            offset_date: 0,
            offset_id: 0,
            offset_peer: tl::enums::InputPeer::Empty,
            limit: 100,
            hash: 0,
        };

        let chats = match self.client.invoke(&request).await.map_err(ProviderError::from)? {
            tl::enums::messages::Dialogs::Dialogs(d) => d.chats,
            tl::enums::messages::Dialogs::Slice(s) => s.chats,
            tl::enums::messages::Dialogs::NotModified(_) => Vec::new(),
        };

        Ok(chats.into_iter().filter_map(chat_to_dialog).collect())
    }

    async fn join_group(&self, link: &str) -> Result<GroupChat, ProviderError> {
        let group = match InviteLink::parse(link)? {
            InviteLink::Private { hash } => self.join_private(&hash).await?,
            InviteLink::Public { username } => self.join_public(&username).await?,
        };
        debug!(
            "Account {} joined \"{}\"",
            mask_phone(&self.phone),
            truncate_for_log(&group.title, 30)
        );
        Ok(group)
    }

    async fn list_members_page(
        &self,
        group: &GroupChat,
        offset: i32,
        recent_only: bool,
    ) -> Result<MemberPage, ProviderError> {
        if offset > 0 {
            self.page_pause().await;
        }

        let filter = if recent_only {
            tl::enums::ChannelParticipantsFilter::Recent
        } else {
            tl::enums::ChannelParticipantsFilter::Search(tl::types::ChannelParticipantsSearch {
                q: String::new(),
            })
        };
        let request = tl::functions::channels::GetParticipants {
            channel: Self::input_channel(group),
            filter,
            offset,
            limit: MEMBER_PAGE_SIZE,
            hash: 0,
        };

        match self.client.invoke(&request).await.map_err(ProviderError::from)? {
            tl::enums::channels::ChannelParticipants::Participants(page) => Ok(MemberPage {
                members: page.users.iter().filter_map(user_to_member).collect(),
                total: i64::from(page.count),
            }),
            tl::enums::channels::ChannelParticipants::NotModified => Ok(MemberPage {
                members: Vec::new(),
                total: 0,
            }),
        }
    }

    async fn invite_member(
        &self,
        target: &GroupChat,
        member: &Member,
    ) -> Result<(), ProviderError> {
        let request = tl::functions::channels::InviteToChannel {
            channel: Self::input_channel(target),
            users: vec![tl::enums::InputUser::User(tl::types::InputUser {
                user_id: member.user_id,
                access_hash: member.access_hash.unwrap_or_default(),
            })],
        };

        let tl::enums::messages::InvitedUsers::InvitedUsers(result) = self
            .client
            .invoke(&request)
            .await
            .map_err(ProviderError::from)?;

        // Privacy refusals surface as missing invitees, not as RPC errors.
        for missing in &result.missing_invitees {
            let tl::enums::MissingInvitee::MissingInvitee(m) = missing;
            if m.user_id == member.user_id {
                return Err(ProviderError::UserNotInvitable(
                    InviteRefusal::PrivacyRestricted,
                ));
            }
        }
        Ok(())
    }

    async fn disconnect(&self, persist_session: bool) -> Result<Option<String>, ProviderError> {
        debug!("Disconnecting account {}", mask_phone(&self.phone));
        self.handle.quit();

        if !persist_session {
            return Ok(None);
        }
        match std::fs::read(&self.session_path) {
            Ok(bytes) => Ok(Some(BASE64.encode(bytes))),
            Err(e) => {
                warn!("Could not read session file for persistence: {e}");
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for GrammersSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrammersSession")
            .field("phone", &mask_phone(&self.phone))
            .field("session_path", &self.session_path)
            .finish_non_exhaustive()
    }
}

fn chats_from_updates(updates: tl::enums::Updates) -> Vec<tl::enums::Chat> {
    match updates {
        tl::enums::Updates::Updates(u) => u.chats,
        tl::enums::Updates::Combined(u) => u.chats,
        _ => Vec::new(),
    }
}

/// Picks the first usable channel out of a chat list.
fn first_channel(chats: Vec<tl::enums::Chat>) -> Result<GroupChat, ProviderError> {
    for chat in chats {
        match chat {
            tl::enums::Chat::Channel(channel) => {
                return Ok(GroupChat {
                    chat_id: channel.id,
                    access_hash: channel.access_hash.unwrap_or_default(),
                    title: channel.title,
                });
            }
            // Basic groups lack the access hash channel calls need.
            tl::enums::Chat::Chat(_) | tl::enums::Chat::Forbidden(_) => {
                return Err(ProviderError::GroupInaccessible(GroupAccess::Private));
            }
            tl::enums::Chat::ChannelForbidden(_) => {
                return Err(ProviderError::GroupInaccessible(GroupAccess::Private));
            }
            tl::enums::Chat::Empty(_) => {}
        }
    }
    Err(ProviderError::GroupInaccessible(GroupAccess::InvalidLink))
}

fn chat_to_dialog(chat: tl::enums::Chat) -> Option<Dialog> {
    match chat {
        tl::enums::Chat::Channel(channel) => Some(Dialog {
            chat_id: channel.id,
            title: channel.title,
            username: channel.username,
            member_count: channel.participants_count.map(i64::from),
            megagroup: channel.megagroup,
        }),
        tl::enums::Chat::Chat(chat) => Some(Dialog {
            chat_id: chat.id,
            title: chat.title,
            username: None,
            member_count: Some(i64::from(chat.participants_count)),
            megagroup: false,
        }),
        _ => None,
    }
}

fn user_to_member(user: &tl::enums::User) -> Option<Member> {
    let tl::enums::User::User(user) = user else {
        return None;
    };
    Some(Member {
        user_id: user.id,
        access_hash: user.access_hash,
        username: user.username.clone(),
        first_name: user.first_name.clone(),
        bot: user.bot,
        deleted: user.deleted,
        scam: user.scam,
        fake: user.fake,
        last_seen: status_to_last_seen(user.status.as_ref()),
    })
}

fn status_to_last_seen(status: Option<&tl::enums::UserStatus>) -> LastSeen {
    match status {
        None | Some(tl::enums::UserStatus::Empty) => LastSeen::Hidden,
        Some(tl::enums::UserStatus::Online(_)) => LastSeen::Online,
        Some(tl::enums::UserStatus::Offline(offline)) => {
            chrono::DateTime::from_timestamp(i64::from(offline.was_online), 0)
                .map_or(LastSeen::Hidden, LastSeen::At)
        }
        Some(tl::enums::UserStatus::Recently(_)) => LastSeen::Recently,
        Some(tl::enums::UserStatus::LastWeek(_)) => LastSeen::LastWeek,
        Some(tl::enums::UserStatus::LastMonth(_)) => LastSeen::LastMonth,
    }
}

fn phone_digits(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

/// Masks a phone number for logging (shows last 4 digits).
pub(crate) fn mask_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() > 4 {
        format!("***{}", &digits[digits.len() - 4..])
    } else {
        "****".to_owned()
    }
}

/// Truncates a string for logging purposes.
pub(crate) fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_owned()
    } else {
        format!("{}...", s.chars().take(max_len).collect::<String>())
    }
}
