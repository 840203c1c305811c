// Test doubles for the run core.
//
// Two fakes matching the two trait boundaries:
// - MemoryLedger (Ledger): stateful in-memory account/group store
// - FakeTelegram (SessionConnector): scripted multi-account provider
//   whose sessions share one world, so cross-account assertions (who
//   invited whom, in which order) are possible after a run.
//
// Plus helpers for building accounts, members and fast settings.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::Settings;
use crate::store::{Account, Group, GroupRole, Ledger, LedgerError, NewAccount};
use crate::telegram::{
    AccountSession, Dialog, GroupAccess, GroupChat, LastSeen, Member, MemberPage, ProviderError,
    SessionConnector,
};

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Account with sequential phone and name, ready for `add_account`.
#[must_use]
pub fn new_account(n: u32) -> NewAccount {
    NewAccount {
        api_id: 10_000 + i32::try_from(n).unwrap_or(0),
        api_hash: format!("hash-{n}"),
        phone: format!("+1555000{n:04}"),
        name: format!("account-{n}"),
        session_blob: None,
    }
}

/// Plain, recently-online member.
#[must_use]
pub fn member(user_id: i64) -> Member {
    Member {
        user_id,
        access_hash: Some(user_id * 7),
        username: Some(format!("user{user_id}")),
        first_name: Some(format!("User {user_id}")),
        bot: false,
        deleted: false,
        scam: false,
        fake: false,
        last_seen: LastSeen::Online,
    }
}

/// Members with consecutive ids, `from..=to`.
#[must_use]
pub fn members(from: i64, to: i64) -> Vec<Member> {
    (from..=to).map(member).collect()
}

/// A bot member, which filters must reject.
#[must_use]
pub fn bot_member(user_id: i64) -> Member {
    Member {
        bot: true,
        ..member(user_id)
    }
}

/// Settings with all pacing zeroed out so runs finish immediately.
#[must_use]
pub fn fast_settings() -> Settings {
    Settings {
        join_interval_secs: 0,
        join_jitter_secs: 0,
        invite_pause_secs: 0,
        invite_pause_jitter_secs: 0,
        page_delay_min_ms: 0,
        page_delay_max_ms: 0,
        status_interval_ms: 10_000,
        ..Settings::default()
    }
}

// ---------------------------------------------------------------------------
// MemoryLedger
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    accounts: Vec<Account>,
    groups: Vec<Group>,
    next_account_id: i64,
    next_group_id: i64,
}

/// In-memory `Ledger` with the same visible semantics as the SQLite
/// implementation.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_account<T>(&self, id: i64, f: impl FnOnce(&mut Account) -> T) -> Option<T> {
        let mut state = self.lock();
        state
            .accounts
            .iter_mut()
            .find(|account| account.id == id)
            .map(f)
    }

    fn with_group<T>(&self, id: i64, f: impl FnOnce(&mut Group) -> T) -> Option<T> {
        let mut state = self.lock();
        state.groups.iter_mut().find(|group| group.id == id).map(f)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn list_eligible_accounts(&self, now: DateTime<Utc>) -> Result<Vec<Account>, LedgerError> {
        let state = self.lock();
        Ok(state
            .accounts
            .iter()
            .filter(|account| {
                account.is_usable()
                    && (account.invites_remaining > 0 || account.quota_window_passed(now))
            })
            .cloned()
            .collect())
    }

    async fn get_account(&self, id: i64) -> Result<Option<Account>, LedgerError> {
        let state = self.lock();
        Ok(state.accounts.iter().find(|a| a.id == id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError> {
        Ok(self.lock().accounts.clone())
    }

    async fn add_account(&self, account: NewAccount) -> Result<Account, LedgerError> {
        let mut state = self.lock();
        state.next_account_id += 1;
        let account = Account {
            id: state.next_account_id,
            api_id: account.api_id,
            api_hash: account.api_hash,
            phone: account.phone,
            name: account.name,
            session_blob: account.session_blob,
            invites_remaining: 0,
            quota_reset_at: None,
            authenticated: true,
            deactivated: false,
            details: None,
        };
        state.accounts.push(account.clone());
        Ok(account)
    }

    async fn delete_account(&self, id: i64) -> Result<(), LedgerError> {
        self.lock().accounts.retain(|account| account.id != id);
        Ok(())
    }

    async fn decrement_invite_quota(&self, id: i64, n: i64) -> Result<(), LedgerError> {
        self.with_account(id, |account| {
            account.invites_remaining = (account.invites_remaining - n).max(0);
        });
        Ok(())
    }

    async fn exhaust_quota(&self, id: i64, reset_at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.with_account(id, |account| {
            account.invites_remaining = 0;
            account.quota_reset_at = Some(reset_at);
        });
        Ok(())
    }

    async fn update_quota(
        &self,
        id: i64,
        invites_remaining: i64,
        quota_reset_at: Option<DateTime<Utc>>,
    ) -> Result<(), LedgerError> {
        self.with_account(id, |account| {
            account.invites_remaining = invites_remaining;
            account.quota_reset_at = quota_reset_at;
        });
        Ok(())
    }

    async fn mark_deactivated(&self, id: i64, reason: &str) -> Result<(), LedgerError> {
        self.with_account(id, |account| {
            account.deactivated = true;
            account.details = Some(reason.to_string());
        });
        Ok(())
    }

    async fn mark_unauthenticated(&self, id: i64, reason: &str) -> Result<(), LedgerError> {
        self.with_account(id, |account| {
            account.authenticated = false;
            account.details = Some(reason.to_string());
        });
        Ok(())
    }

    async fn save_session(&self, id: i64, blob: &str) -> Result<(), LedgerError> {
        self.with_account(id, |account| {
            account.session_blob = Some(blob.to_string());
        });
        Ok(())
    }

    async fn list_enabled_source_groups(&self) -> Result<Vec<Group>, LedgerError> {
        let state = self.lock();
        Ok(state
            .groups
            .iter()
            .filter(|group| group.enabled && group.role == GroupRole::Source)
            .cloned()
            .collect())
    }

    async fn get_target_group(&self) -> Result<Option<Group>, LedgerError> {
        let state = self.lock();
        Ok(state
            .groups
            .iter()
            .find(|group| group.role == GroupRole::Target)
            .cloned())
    }

    async fn list_groups(&self) -> Result<Vec<Group>, LedgerError> {
        Ok(self.lock().groups.clone())
    }

    async fn add_group(
        &self,
        link: &str,
        name: Option<&str>,
        role: GroupRole,
    ) -> Result<Group, LedgerError> {
        let mut state = self.lock();
        if role == GroupRole::Target {
            for group in &mut state.groups {
                if group.role == GroupRole::Target {
                    group.role = GroupRole::Source;
                }
            }
        }
        state.next_group_id += 1;
        let group = Group {
            id: state.next_group_id,
            link: link.to_string(),
            name: name.map(ToString::to_string),
            role,
            enabled: true,
            member_count: 0,
            details: None,
        };
        state.groups.push(group.clone());
        Ok(group)
    }

    async fn delete_group(&self, id: i64) -> Result<(), LedgerError> {
        self.lock().groups.retain(|group| group.id != id);
        Ok(())
    }

    async fn set_target_group(&self, id: i64) -> Result<(), LedgerError> {
        let mut state = self.lock();
        for group in &mut state.groups {
            group.role = if group.id == id {
                GroupRole::Target
            } else if group.role == GroupRole::Target {
                GroupRole::Source
            } else {
                group.role
            };
        }
        Ok(())
    }

    async fn set_group_enabled(&self, id: i64, enabled: bool) -> Result<(), LedgerError> {
        self.with_group(id, |group| group.enabled = enabled);
        Ok(())
    }

    async fn disable_group(&self, id: i64, reason: &str) -> Result<(), LedgerError> {
        self.with_group(id, |group| {
            group.enabled = false;
            group.details = Some(reason.to_string());
        });
        Ok(())
    }

    async fn update_member_count(&self, id: i64, count: i64) -> Result<(), LedgerError> {
        self.with_group(id, |group| group.member_count = count);
        Ok(())
    }

    async fn update_group_name(&self, id: i64, name: &str) -> Result<(), LedgerError> {
        self.with_group(id, |group| group.name = Some(name.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeTelegram
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FakeGroup {
    link: String,
    chat_id: i64,
    title: String,
    members: Vec<Member>,
    join_errors: VecDeque<ProviderError>,
    list_errors: VecDeque<ProviderError>,
}

#[derive(Debug, Default)]
struct FakeWorld {
    groups: Vec<FakeGroup>,
    dialogs: Vec<Dialog>,
    page_size: usize,
    unauthorized: HashSet<String>,
    sign_in_errors: HashMap<String, VecDeque<ProviderError>>,
    connect_errors: HashMap<String, VecDeque<ProviderError>>,
    invite_errors: HashMap<i64, VecDeque<ProviderError>>,
    fail_invites_after: HashMap<String, (usize, ProviderError)>,
    invites: Vec<(String, i64)>,
    invite_attempts: usize,
    joins: Vec<(String, String)>,
    persisted: Vec<String>,
}

impl FakeWorld {
    fn group_by_link(&mut self, link: &str) -> Option<&mut FakeGroup> {
        self.groups.iter_mut().find(|group| group.link == link)
    }

    fn group_by_chat(&mut self, chat_id: i64) -> Option<&mut FakeGroup> {
        self.groups.iter_mut().find(|group| group.chat_id == chat_id)
    }
}

/// Scripted Telegram provider. Clone it before handing it to the
/// orchestrator; every clone and every session shares the same world.
#[derive(Debug, Clone)]
pub struct FakeTelegram {
    world: Arc<Mutex<FakeWorld>>,
}

impl Default for FakeTelegram {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTelegram {
    #[must_use]
    pub fn new() -> Self {
        Self {
            world: Arc::new(Mutex::new(FakeWorld {
                page_size: 100,
                ..FakeWorld::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeWorld> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn with_group(self, link: &str, chat_id: i64, title: &str, members: Vec<Member>) -> Self {
        self.lock().groups.push(FakeGroup {
            link: link.to_string(),
            chat_id,
            title: title.to_string(),
            members,
            join_errors: VecDeque::new(),
            list_errors: VecDeque::new(),
        });
        self
    }

    #[must_use]
    pub fn with_dialog(self, dialog: Dialog) -> Self {
        self.lock().dialogs.push(dialog);
        self
    }

    #[must_use]
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.lock().page_size = page_size.max(1);
        self
    }

    /// Queues an error for the next join attempt on `link`.
    #[must_use]
    pub fn with_join_error(self, link: &str, error: ProviderError) -> Self {
        if let Some(group) = self.lock().group_by_link(link) {
            group.join_errors.push_back(error);
        }
        self
    }

    /// Queues an error for the next member-page request on `link`.
    #[must_use]
    pub fn with_list_error(self, link: &str, error: ProviderError) -> Self {
        if let Some(group) = self.lock().group_by_link(link) {
            group.list_errors.push_back(error);
        }
        self
    }

    /// Queues an error for the next invite of `user_id`, whoever sends it.
    #[must_use]
    pub fn with_invite_error(self, user_id: i64, error: ProviderError) -> Self {
        self.lock()
            .invite_errors
            .entry(user_id)
            .or_default()
            .push_back(error);
        self
    }

    /// Starts the phone without a stored authorization.
    #[must_use]
    pub fn with_unauthorized(self, phone: &str) -> Self {
        self.lock().unauthorized.insert(phone.to_string());
        self
    }

    #[must_use]
    pub fn with_sign_in_error(self, phone: &str, error: ProviderError) -> Self {
        self.lock()
            .sign_in_errors
            .entry(phone.to_string())
            .or_default()
            .push_back(error);
        self
    }

    #[must_use]
    pub fn with_connect_error(self, phone: &str, error: ProviderError) -> Self {
        self.lock()
            .connect_errors
            .entry(phone.to_string())
            .or_default()
            .push_back(error);
        self
    }

    /// Every invite from `phone` after `n` successful ones fails with
    /// `error`.
    #[must_use]
    pub fn with_invites_failing_after(self, phone: &str, n: usize, error: ProviderError) -> Self {
        self.lock()
            .fail_invites_after
            .insert(phone.to_string(), (n, error));
        self
    }

    /// Successful invites in order, as (phone, user id) pairs.
    #[must_use]
    pub fn invited(&self) -> Vec<(String, i64)> {
        self.lock().invites.clone()
    }

    /// User ids invited, in order.
    #[must_use]
    pub fn invited_user_ids(&self) -> Vec<i64> {
        self.lock().invites.iter().map(|(_, id)| *id).collect()
    }

    /// All invite submissions, including rejected ones.
    #[must_use]
    pub fn invite_attempts(&self) -> usize {
        self.lock().invite_attempts
    }

    /// How many times any account joined `link`.
    #[must_use]
    pub fn join_count(&self, link: &str) -> usize {
        self.lock().joins.iter().filter(|(_, l)| l == link).count()
    }

    /// Phones whose sessions were persisted on disconnect.
    #[must_use]
    pub fn persisted_sessions(&self) -> Vec<String> {
        self.lock().persisted.clone()
    }
}

#[async_trait]
impl SessionConnector for FakeTelegram {
    async fn connect(&self, account: &Account) -> Result<Box<dyn AccountSession>, ProviderError> {
        if let Some(queue) = self.lock().connect_errors.get_mut(&account.phone) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }
        Ok(Box::new(FakeSession {
            phone: account.phone.clone(),
            world: Arc::clone(&self.world),
        }))
    }
}

/// One account's view of the shared fake world.
#[derive(Debug)]
pub struct FakeSession {
    phone: String,
    world: Arc<Mutex<FakeWorld>>,
}

impl FakeSession {
    fn lock(&self) -> MutexGuard<'_, FakeWorld> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AccountSession for FakeSession {
    async fn is_authorized(&self) -> Result<bool, ProviderError> {
        Ok(!self.lock().unauthorized.contains(&self.phone))
    }

    async fn send_login_code(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn sign_in(&self, _code: &str) -> Result<(), ProviderError> {
        let mut world = self.lock();
        if let Some(queue) = world.sign_in_errors.get_mut(&self.phone) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }
        world.unauthorized.remove(&self.phone);
        Ok(())
    }

    async fn list_dialogs(&self) -> Result<Vec<Dialog>, ProviderError> {
        Ok(self.lock().dialogs.clone())
    }

    async fn join_group(&self, link: &str) -> Result<GroupChat, ProviderError> {
        let mut world = self.lock();
        let phone = self.phone.clone();
        let Some(group) = world.group_by_link(link) else {
            return Err(ProviderError::GroupInaccessible(GroupAccess::InvalidLink));
        };
        if let Some(error) = group.join_errors.pop_front() {
            return Err(error);
        }
        let chat = GroupChat {
            chat_id: group.chat_id,
            access_hash: 1,
            title: group.title.clone(),
        };
        world.joins.push((phone, link.to_string()));
        Ok(chat)
    }

    async fn list_members_page(
        &self,
        group: &GroupChat,
        offset: i32,
        _recent_only: bool,
    ) -> Result<MemberPage, ProviderError> {
        let mut world = self.lock();
        let page_size = world.page_size;
        let Some(group) = world.group_by_chat(group.chat_id) else {
            return Err(ProviderError::GroupInaccessible(GroupAccess::Private));
        };
        if let Some(error) = group.list_errors.pop_front() {
            return Err(error);
        }
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(group.members.len());
        let end = (start + page_size).min(group.members.len());
        Ok(MemberPage {
            members: group.members[start..end].to_vec(),
            total: i64::try_from(group.members.len()).unwrap_or(i64::MAX),
        })
    }

    async fn invite_member(
        &self,
        target: &GroupChat,
        member: &Member,
    ) -> Result<(), ProviderError> {
        let mut world = self.lock();
        world.invite_attempts += 1;
        if let Some(queue) = world.invite_errors.get_mut(&member.user_id) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }
        if let Some((after, error)) = world.fail_invites_after.get(&self.phone) {
            let sent = world
                .invites
                .iter()
                .filter(|(phone, _)| phone == &self.phone)
                .count();
            if sent >= *after {
                return Err(error.clone());
            }
        }
        world.invites.push((self.phone.clone(), member.user_id));
        // The invited user becomes a member of the target group.
        if let Some(group) = world.group_by_chat(target.chat_id) {
            if !group.members.iter().any(|m| m.user_id == member.user_id) {
                group.members.push(member.clone());
            }
        }
        Ok(())
    }

    async fn disconnect(&self, persist_session: bool) -> Result<Option<String>, ProviderError> {
        if persist_session {
            self.lock().persisted.push(self.phone.clone());
            Ok(Some(format!("session-{}", self.phone)))
        } else {
            Ok(None)
        }
    }
}
