//! Worker task: drives one account at a time against the group queue.
//!
//! Each worker pulls an account, signs it in, joins the target group,
//! then works source groups popped from the shared queue until the
//! account runs out of quota or usable groups. A finished account is
//! never returned to the pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{LastSeenFilter, Settings};
use crate::frontend::{CodeReply, FrontendLink};
use crate::store::{Account, Group, Ledger, LedgerError};
use crate::telegram::{
    AccountSession, GroupAccess, GroupChat, Member, ProviderError, RateLimiter, SessionConnector,
    mask_phone,
};

use super::dedup::{ClaimOutcome, DedupSet};
use super::filter::member_invitable;
use super::pool::{AccountPool, PooledAccount};
use super::queue::{GroupQueue, QueuedGroup};
use super::quota::QuotaPolicy;
use super::state::{AccountOutcome, GroupRunStatus, RunStats};

/// Permanent access failures from this many distinct accounts disable
/// a source group. An invalid link disables it on the first failure.
const GROUP_FAILURE_THRESHOLD: usize = 2;

/// Consecutive peer-flood errors before the account is dropped.
const PEER_FLOOD_LIMIT: u32 = 3;

/// Base backoff range after a peer-flood error, in seconds.
const PEER_FLOOD_BACKOFF_SECS: (u64, u64) = (60, 120);

/// Ceiling for escalated peer-flood backoffs.
const PEER_FLOOD_BACKOFF_CAP: Duration = Duration::from_secs(600);

/// An account a worker is actively driving.
pub(crate) struct ActiveAccount {
    pub(crate) account: Account,
    pub(crate) session: Box<dyn AccountSession>,
    pub(crate) target_chat: GroupChat,
    pacer: RateLimiter,
    peer_floods: u32,
}

impl ActiveAccount {
    /// Returns the account to pooled form with its session kept alive.
    pub(crate) fn into_pooled(self) -> PooledAccount {
        PooledAccount {
            account: self.account,
            session: Some(self.session),
            target_chat: Some(self.target_chat),
        }
    }
}

/// Why the worker stopped driving an account.
enum AccountEnd {
    /// The shared queue is empty; the worker winds down entirely.
    QueueEmpty,
    /// Every remaining group is one this account cannot work.
    NoWorkLeft,
    /// Invite quota ran out.
    Exhausted,
    /// The account can no longer participate in this run.
    Dropped(String),
    Cancelled,
}

/// Why a scrape pass over one group ended.
enum ScrapeEnd {
    /// Every member page was consumed.
    FullPass { seen: i64 },
    QuotaExhausted,
    /// Access to the source group was lost mid-scrape.
    GroupLost { permanent: bool },
    AccountDropped(ProviderError),
    Cancelled,
}

enum JoinResult {
    Joined(GroupChat),
    /// This account skips the group; others may still work it.
    SkipGroup,
    /// The group was disabled and leaves the queue for good.
    GroupDropped,
    AccountDropped(String),
    Cancelled,
}

enum InviteStep {
    Continue,
    QuotaExhausted,
    AccountDropped(ProviderError),
    Cancelled,
}

pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) ledger: Arc<dyn Ledger>,
    pub(crate) connector: Arc<dyn SessionConnector>,
    pub(crate) pool: Arc<AccountPool>,
    pub(crate) queue: Arc<GroupQueue>,
    pub(crate) dedup: Arc<DedupSet>,
    pub(crate) stats: Arc<RwLock<RunStats>>,
    pub(crate) link: Arc<FrontendLink>,
    pub(crate) policy: QuotaPolicy,
    pub(crate) settings: Settings,
    pub(crate) target: Group,
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) abort_tx: mpsc::Sender<String>,
}

impl Worker {
    pub(crate) async fn run(self) {
        self.stats.write().await.worker_started();
        debug!(worker = self.id, "worker started");
        loop {
            if self.cancelled() {
                break;
            }
            let Some(pooled) = self.pool.pull().await else {
                debug!(worker = self.id, "account pool drained");
                break;
            };
            let account_id = pooled.account.id;
            match self.activate(pooled).await {
                Ok(Some(active)) => {
                    self.stats.write().await.account_used(account_id);
                    match self.drive(active).await {
                        Ok(AccountEnd::QueueEmpty) => {
                            debug!(worker = self.id, "group queue empty");
                            break;
                        }
                        Ok(AccountEnd::Cancelled) => break,
                        Ok(_) => {}
                        Err(err) => {
                            self.abort(format!("storage failure: {err}"));
                            break;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    self.abort(format!("storage failure: {err}"));
                    break;
                }
            }
        }
        self.stats.write().await.worker_finished();
        debug!(worker = self.id, "worker finished");
    }

    /// Turns a pooled account into a live, signed-in session that is a
    /// member of the target group. `None` means the account was skipped
    /// and the caller should pull the next one.
    pub(crate) async fn activate(
        &self,
        pooled: PooledAccount,
    ) -> Result<Option<ActiveAccount>, LedgerError> {
        let PooledAccount {
            account: stale,
            session,
            target_chat,
        } = pooled;

        // Re-read right before use; the record may have changed since
        // the pool was built.
        let Some(mut account) = self.ledger.get_account(stale.id).await? else {
            return Ok(None);
        };
        if !account.is_usable() {
            debug!(account = %mask_phone(&account.phone), "account retired, skipping");
            return Ok(None);
        }
        let now = Utc::now();
        let before = account.invites_remaining;
        if !self.policy.can_invite(&mut account, now) {
            debug!(account = %mask_phone(&account.phone), "no invite quota, skipping");
            return Ok(None);
        }
        if account.invites_remaining != before {
            // Replenished; make it durable before spending any of it.
            self.ledger
                .update_quota(account.id, account.invites_remaining, account.quota_reset_at)
                .await?;
        }

        let session = match session {
            Some(session) => session,
            None => match self.connector.connect(&account).await {
                Ok(session) => session,
                Err(err) => {
                    self.handle_account_error(&account, &err).await?;
                    return Ok(None);
                }
            },
        };

        if !self.ensure_authorized(session.as_ref(), &account).await? {
            if let Err(err) = session.disconnect(false).await {
                debug!(error = %err, "disconnect after failed login");
            }
            return Ok(None);
        }

        let target_chat = match target_chat {
            Some(chat) => chat,
            None => match self.join_target(session.as_ref(), &account).await? {
                Some(chat) => chat,
                None => {
                    if let Err(err) = session.disconnect(false).await {
                        debug!(error = %err, "disconnect after failed target join");
                    }
                    return Ok(None);
                }
            },
        };

        Ok(Some(ActiveAccount {
            account,
            session,
            target_chat,
            pacer: RateLimiter::from_secs(
                self.settings.invite_pause_secs,
                self.settings.invite_pause_jitter_secs,
            ),
            peer_floods: 0,
        }))
    }

    /// Works groups from the shared queue until the account is spent.
    async fn drive(&self, mut active: ActiveAccount) -> Result<AccountEnd, LedgerError> {
        let mut skipped: HashSet<i64> = HashSet::new();
        let mut consecutive_skips = 0usize;
        let end = loop {
            if self.cancelled() {
                break AccountEnd::Cancelled;
            }
            if !self.policy.can_invite(&mut active.account, Utc::now()) {
                break AccountEnd::Exhausted;
            }
            let Some(mut entry) = self.queue.pop() else {
                break AccountEnd::QueueEmpty;
            };
            let group_id = entry.group.id;

            if entry.has_failed_for(active.account.id) || skipped.contains(&group_id) {
                consecutive_skips += 1;
                let in_rotation = self.queue.len() + 1;
                self.queue.requeue(entry);
                if consecutive_skips >= in_rotation {
                    break AccountEnd::NoWorkLeft;
                }
                continue;
            }
            consecutive_skips = 0;

            // Honor the group's join cadence before touching it.
            if !self.wait_until(entry.next_allowed_at).await {
                self.queue.requeue(entry);
                break AccountEnd::Cancelled;
            }

            let chat = match self.join_source(&active, &mut entry).await? {
                JoinResult::Joined(chat) => chat,
                JoinResult::SkipGroup => {
                    skipped.insert(group_id);
                    self.queue.requeue(entry);
                    continue;
                }
                JoinResult::GroupDropped => continue,
                JoinResult::AccountDropped(reason) => {
                    self.queue.requeue(entry);
                    break AccountEnd::Dropped(reason);
                }
                JoinResult::Cancelled => {
                    self.queue.requeue(entry);
                    break AccountEnd::Cancelled;
                }
            };

            // The cadence clock restarts at the successful join.
            entry.next_allowed_at = self.policy.next_join_allowed_at(Utc::now());
            {
                let mut stats = self.stats.write().await;
                stats.group_joined(group_id, active.account.id);
                stats.begin_scrape(group_id);
            }
            info!(
                worker = self.id,
                group = %entry.group.display_name(),
                account = %mask_phone(&active.account.phone),
                "scraping source group"
            );

            match self.scrape(&mut active, &entry, &chat).await? {
                ScrapeEnd::FullPass { seen } => {
                    self.ledger.update_member_count(group_id, seen).await?;
                    self.stats
                        .write()
                        .await
                        .end_scrape(group_id, GroupRunStatus::Exhausted);
                    info!(group = %entry.group.display_name(), seen, "source group fully scraped");
                    self.log_line(format!(
                        "{} fully scraped ({seen} members)",
                        entry.group.display_name()
                    ))
                    .await;
                    // A fully scraped group leaves the rotation.
                }
                ScrapeEnd::QuotaExhausted => {
                    self.stats
                        .write()
                        .await
                        .end_scrape(group_id, GroupRunStatus::Waiting);
                    self.queue.requeue(entry);
                    break AccountEnd::Exhausted;
                }
                ScrapeEnd::GroupLost { permanent } => {
                    {
                        let mut stats = self.stats.write().await;
                        stats.end_scrape(group_id, GroupRunStatus::Waiting);
                        if permanent {
                            stats.group_kicked(group_id, active.account.id);
                        }
                    }
                    if permanent
                        && entry.record_failed_account(active.account.id)
                            >= GROUP_FAILURE_THRESHOLD
                    {
                        self.disable_group(&entry, "inaccessible for multiple accounts")
                            .await?;
                        continue;
                    }
                    skipped.insert(group_id);
                    self.queue.requeue(entry);
                }
                ScrapeEnd::AccountDropped(err) => {
                    self.stats
                        .write()
                        .await
                        .end_scrape(group_id, GroupRunStatus::Waiting);
                    self.queue.requeue(entry);
                    self.retire_account(&active.account, &err).await?;
                    break AccountEnd::Dropped(err.to_string());
                }
                ScrapeEnd::Cancelled => {
                    self.stats
                        .write()
                        .await
                        .end_scrape(group_id, GroupRunStatus::Waiting);
                    self.queue.requeue(entry);
                    break AccountEnd::Cancelled;
                }
            }
        };
        self.release(active, &end).await?;
        Ok(end)
    }

    /// One scrape pass: page through members and invite the eligible
    /// ones until the pages or the quota run out.
    async fn scrape(
        &self,
        active: &mut ActiveAccount,
        entry: &QueuedGroup,
        chat: &GroupChat,
    ) -> Result<ScrapeEnd, LedgerError> {
        let group_id = entry.group.id;
        let recent_only = self.settings.last_seen_filter != LastSeenFilter::Off;
        let mut offset = 0i32;
        let mut seen = 0i64;
        let mut total = 0i64;
        loop {
            if self.cancelled() {
                return Ok(ScrapeEnd::Cancelled);
            }
            let page = match active.session.list_members_page(chat, offset, recent_only).await {
                Ok(page) => page,
                Err(ProviderError::FloodWait(seconds)) => {
                    self.log_line(format!(
                        "flood wait {seconds}s listing {}",
                        entry.group.display_name()
                    ))
                    .await;
                    if self.flood_sleep(seconds).await {
                        return Ok(ScrapeEnd::Cancelled);
                    }
                    continue;
                }
                Err(err @ ProviderError::GroupInaccessible(_)) => {
                    warn!(
                        group = %entry.group.display_name(),
                        error = %err,
                        "lost access to source group mid-scrape"
                    );
                    return Ok(ScrapeEnd::GroupLost { permanent: true });
                }
                Err(err)
                    if err.is_account_fatal()
                        || matches!(
                            err,
                            ProviderError::NotAuthorized | ProviderError::Connection(_)
                        ) =>
                {
                    return Ok(ScrapeEnd::AccountDropped(err));
                }
                Err(err) => {
                    warn!(
                        group = %entry.group.display_name(),
                        error = %err,
                        "member page failed"
                    );
                    return Ok(ScrapeEnd::GroupLost { permanent: false });
                }
            };
            if page.total > 0 {
                total = page.total;
            }
            if page.is_last() {
                return Ok(ScrapeEnd::FullPass {
                    seen: if total > 0 { total } else { seen },
                });
            }
            let fetched = page.members.len();
            for member in page.members {
                seen += 1;
                if self.cancelled() {
                    return Ok(ScrapeEnd::Cancelled);
                }
                if !member_invitable(&member, self.settings.last_seen_filter, Utc::now()) {
                    continue;
                }
                if self.dedup.contains(member.user_id).await {
                    continue;
                }
                if active.account.invites_remaining <= 0 {
                    return Ok(ScrapeEnd::QuotaExhausted);
                }
                match self.invite_one(active, group_id, &member).await? {
                    InviteStep::Continue => {}
                    InviteStep::QuotaExhausted => return Ok(ScrapeEnd::QuotaExhausted),
                    InviteStep::AccountDropped(err) => return Ok(ScrapeEnd::AccountDropped(err)),
                    InviteStep::Cancelled => return Ok(ScrapeEnd::Cancelled),
                }
            }
            offset += i32::try_from(fetched).unwrap_or(i32::MAX);
        }
    }

    /// Paces, then runs the atomic claim-invite-record sequence for one
    /// member, retrying the same member through flood waits.
    async fn invite_one(
        &self,
        active: &mut ActiveAccount,
        group_id: i64,
        member: &Member,
    ) -> Result<InviteStep, LedgerError> {
        loop {
            let mut cancel = self.cancel.clone();
            tokio::select! {
                _ = active.pacer.wait_and_acquire() => {}
                _ = cancel.wait_for(|cancelled| *cancelled) => return Ok(InviteStep::Cancelled),
            }

            let session = active.session.as_ref();
            let target = &active.target_chat;
            let result = self
                .dedup
                .claim_invite(member.user_id, || session.invite_member(target, member))
                .await;

            match result {
                Ok(ClaimOutcome::AlreadyProcessed) => return Ok(InviteStep::Continue),
                Ok(ClaimOutcome::Invited) => {
                    active.account.invites_remaining -= 1;
                    active.peer_floods = 0;
                    self.ledger
                        .decrement_invite_quota(active.account.id, 1)
                        .await?;
                    self.stats
                        .write()
                        .await
                        .user_invited(group_id, member.user_id);
                    debug!(
                        user = member.user_id,
                        remaining = active.account.invites_remaining,
                        "invited user to target"
                    );
                    if active.account.invites_remaining <= 0 {
                        return Ok(InviteStep::QuotaExhausted);
                    }
                    return Ok(InviteStep::Continue);
                }
                Err(ProviderError::UserNotInvitable(refusal)) => {
                    self.stats
                        .write()
                        .await
                        .user_refused(group_id, member.user_id);
                    debug!(user = member.user_id, %refusal, "invite refused");
                    self.log_line(format!("invite refused: {refusal}")).await;
                    return Ok(InviteStep::Continue);
                }
                Err(ProviderError::FloodWait(seconds)) => {
                    self.log_line(format!("flood wait {seconds}s on invite")).await;
                    if self.flood_sleep(seconds).await {
                        return Ok(InviteStep::Cancelled);
                    }
                    // Retry the same member; nothing was recorded.
                }
                Err(ProviderError::PeerFlood) => {
                    active.peer_floods += 1;
                    if active.peer_floods >= PEER_FLOOD_LIMIT {
                        return Ok(InviteStep::AccountDropped(ProviderError::PeerFlood));
                    }
                    let backoff = peer_flood_backoff(active.peer_floods);
                    warn!(
                        account = %mask_phone(&active.account.phone),
                        attempt = active.peer_floods,
                        backoff_secs = backoff.as_secs(),
                        "peer flood, backing off"
                    );
                    self.log_line(format!("peer flood, backing off {}s", backoff.as_secs()))
                        .await;
                    if self.sleep_cancellable(backoff).await {
                        return Ok(InviteStep::Cancelled);
                    }
                }
                Err(
                    err @ (ProviderError::WriteForbidden
                    | ProviderError::GroupInaccessible(_)
                    | ProviderError::BannedInChannels),
                ) => {
                    // The target no longer accepts this account.
                    return Ok(InviteStep::AccountDropped(err));
                }
                Err(err)
                    if err.is_account_fatal()
                        || matches!(
                            err,
                            ProviderError::NotAuthorized | ProviderError::Connection(_)
                        ) =>
                {
                    return Ok(InviteStep::AccountDropped(err));
                }
                Err(err) => {
                    self.stats
                        .write()
                        .await
                        .user_refused(group_id, member.user_id);
                    self.log_line(format!("invite failed: {err}")).await;
                    return Ok(InviteStep::Continue);
                }
            }
        }
    }

    async fn join_source(
        &self,
        active: &ActiveAccount,
        entry: &mut QueuedGroup,
    ) -> Result<JoinResult, LedgerError> {
        let name = entry.group.display_name().to_string();
        loop {
            if self.cancelled() {
                return Ok(JoinResult::Cancelled);
            }
            match active.session.join_group(&entry.group.link).await {
                Ok(chat) => return Ok(JoinResult::Joined(chat)),
                Err(ProviderError::FloodWait(seconds)) => {
                    self.log_line(format!("flood wait {seconds}s joining {name}")).await;
                    if self.flood_sleep(seconds).await {
                        return Ok(JoinResult::Cancelled);
                    }
                }
                Err(err @ ProviderError::GroupInaccessible(access)) => {
                    warn!(group = %name, error = %err, "source group inaccessible");
                    let failures = entry.record_failed_account(active.account.id);
                    let threshold = if access == GroupAccess::InvalidLink {
                        1
                    } else {
                        GROUP_FAILURE_THRESHOLD
                    };
                    if failures >= threshold {
                        self.disable_group(entry, &err.to_string()).await?;
                        return Ok(JoinResult::GroupDropped);
                    }
                    self.log_line(format!("{name}: {err}")).await;
                    return Ok(JoinResult::SkipGroup);
                }
                Err(err) if err.is_account_fatal() => {
                    self.retire_account(&active.account, &err).await?;
                    return Ok(JoinResult::AccountDropped(err.to_string()));
                }
                Err(err @ (ProviderError::NotAuthorized | ProviderError::BannedInChannels)) => {
                    self.retire_account(&active.account, &err).await?;
                    return Ok(JoinResult::AccountDropped(err.to_string()));
                }
                Err(err) => {
                    warn!(group = %name, error = %err, "join failed, skipping for this account");
                    self.log_line(format!("{name}: join failed: {err}")).await;
                    return Ok(JoinResult::SkipGroup);
                }
            }
        }
    }

    /// Joins the target group, retrying through flood waits. `None`
    /// drops the account from the run.
    async fn join_target(
        &self,
        session: &dyn AccountSession,
        account: &Account,
    ) -> Result<Option<GroupChat>, LedgerError> {
        let phone = mask_phone(&account.phone);
        loop {
            if self.cancelled() {
                return Ok(None);
            }
            match session.join_group(&self.target.link).await {
                Ok(chat) => {
                    debug!(account = %phone, target = %chat.title, "joined target group");
                    return Ok(Some(chat));
                }
                Err(ProviderError::FloodWait(seconds)) => {
                    self.log_line(format!("{phone}: flood wait {seconds}s joining target"))
                        .await;
                    if self.flood_sleep(seconds).await {
                        return Ok(None);
                    }
                }
                Err(ProviderError::GroupInaccessible(GroupAccess::InvalidLink)) => {
                    self.abort(format!("target link {} is invalid", self.target.link));
                    return Ok(None);
                }
                Err(err) if err.is_account_fatal() => {
                    self.retire_account(account, &err).await?;
                    return Ok(None);
                }
                Err(err @ ProviderError::NotAuthorized) => {
                    self.retire_account(account, &err).await?;
                    return Ok(None);
                }
                Err(err) => {
                    warn!(
                        account = %phone,
                        error = %err,
                        "cannot join target, dropping account for this run"
                    );
                    self.log_line(format!("{phone}: cannot join target: {err}")).await;
                    self.record_outcome(account.id, AccountOutcome::Dropped).await;
                    return Ok(None);
                }
            }
        }
    }

    /// Interactive sign-in driven through the front end. Returns `false`
    /// when the account should be skipped.
    async fn ensure_authorized(
        &self,
        session: &dyn AccountSession,
        account: &Account,
    ) -> Result<bool, LedgerError> {
        match session.is_authorized().await {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(err) => {
                self.handle_account_error(account, &err).await?;
                return Ok(false);
            }
        }

        let phone = mask_phone(&account.phone);
        info!(account = %phone, "no stored session, requesting login code");
        if let Err(err) = self.send_code(session).await {
            self.handle_account_error(account, &err).await?;
            return Ok(false);
        }

        loop {
            if self.cancelled() {
                return Ok(false);
            }
            match self.link.request_login_code(&phone).await {
                CodeReply::Skip => {
                    info!(account = %phone, "login skipped by operator");
                    self.record_outcome(account.id, AccountOutcome::LoginFailed).await;
                    return Ok(false);
                }
                CodeReply::Resend => {
                    if let Err(err) = self.send_code(session).await {
                        self.handle_account_error(account, &err).await?;
                        return Ok(false);
                    }
                    self.log_line(format!("{phone}: login code resent")).await;
                }
                CodeReply::Code(code) => match session.sign_in(&code).await {
                    Ok(()) => {
                        info!(account = %phone, "signed in");
                        return Ok(true);
                    }
                    Err(ProviderError::CodeInvalid) => {
                        self.log_line(format!("{phone}: login code rejected")).await;
                    }
                    Err(ProviderError::CodeExpired) => {
                        self.log_line(format!("{phone}: login code expired, resending")).await;
                        if let Err(err) = self.send_code(session).await {
                            self.handle_account_error(account, &err).await?;
                            return Ok(false);
                        }
                    }
                    Err(ProviderError::PasswordRequired) => {
                        warn!(account = %phone, "two-factor password required, retiring account");
                        self.ledger
                            .mark_unauthenticated(account.id, "two-factor password required")
                            .await?;
                        self.record_outcome(account.id, AccountOutcome::LoginFailed).await;
                        return Ok(false);
                    }
                    Err(err) => {
                        self.handle_account_error(account, &err).await?;
                        return Ok(false);
                    }
                },
            }
        }
    }

    async fn send_code(&self, session: &dyn AccountSession) -> Result<(), ProviderError> {
        loop {
            match session.send_login_code().await {
                Ok(()) => return Ok(()),
                Err(ProviderError::FloodWait(seconds)) => {
                    self.log_line(format!("flood wait {seconds}s requesting login code"))
                        .await;
                    if self.flood_sleep(seconds).await {
                        return Err(ProviderError::FloodWait(seconds));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Routes an account-level failure to the right ledger flag.
    async fn handle_account_error(
        &self,
        account: &Account,
        err: &ProviderError,
    ) -> Result<(), LedgerError> {
        let phone = mask_phone(&account.phone);
        match err {
            ProviderError::InvalidCredentials => {
                warn!(account = %phone, "api credentials rejected, retiring account");
                self.ledger
                    .mark_unauthenticated(account.id, "invalid api credentials")
                    .await?;
                self.record_outcome(account.id, AccountOutcome::LoginFailed).await;
                self.log_line(format!("{phone}: invalid api credentials")).await;
            }
            ProviderError::PhoneBanned | ProviderError::AccountDeactivated => {
                warn!(account = %phone, error = %err, "account retired by telegram");
                self.ledger
                    .mark_deactivated(account.id, &err.to_string())
                    .await?;
                self.record_outcome(account.id, AccountOutcome::Banned).await;
                self.log_line(format!("{phone}: {err}")).await;
            }
            ProviderError::NotAuthorized => {
                warn!(account = %phone, "stored session rejected");
                self.ledger
                    .mark_unauthenticated(account.id, "session expired")
                    .await?;
                self.record_outcome(account.id, AccountOutcome::LoginFailed).await;
            }
            _ => {
                warn!(account = %phone, error = %err, "account skipped");
                self.record_outcome(account.id, AccountOutcome::LoginFailed).await;
                self.log_line(format!("{phone}: {err}")).await;
            }
        }
        Ok(())
    }

    /// Flags the account in the ledger after a mid-run failure.
    async fn retire_account(
        &self,
        account: &Account,
        err: &ProviderError,
    ) -> Result<(), LedgerError> {
        let phone = mask_phone(&account.phone);
        if err.is_account_fatal() {
            warn!(account = %phone, error = %err, "account retired by telegram");
            self.ledger
                .mark_deactivated(account.id, &err.to_string())
                .await?;
            self.record_outcome(account.id, AccountOutcome::Banned).await;
        } else if matches!(err, ProviderError::NotAuthorized) {
            warn!(account = %phone, "session expired mid-run");
            self.ledger
                .mark_unauthenticated(account.id, "session expired")
                .await?;
            self.record_outcome(account.id, AccountOutcome::LoginFailed).await;
        } else {
            warn!(account = %phone, error = %err, "account dropped for this run");
            self.record_outcome(account.id, AccountOutcome::Dropped).await;
        }
        self.log_line(format!("{phone} dropped: {err}")).await;
        Ok(())
    }

    async fn disable_group(&self, entry: &QueuedGroup, reason: &str) -> Result<(), LedgerError> {
        self.ledger.disable_group(entry.group.id, reason).await?;
        self.stats
            .write()
            .await
            .set_group_status(entry.group.id, GroupRunStatus::Disabled);
        warn!(group = %entry.group.display_name(), reason, "source group disabled");
        self.log_line(format!("{} disabled: {reason}", entry.group.display_name()))
            .await;
        Ok(())
    }

    /// Persists quota and session state when the account leaves the run.
    async fn release(&self, active: ActiveAccount, end: &AccountEnd) -> Result<(), LedgerError> {
        let ActiveAccount {
            account, session, ..
        } = active;
        let phone = mask_phone(&account.phone);
        match end {
            AccountEnd::Exhausted => {
                let until = self.policy.exhausted_until(Utc::now());
                self.ledger.exhaust_quota(account.id, until).await?;
                self.record_outcome(account.id, AccountOutcome::Exhausted).await;
                info!(account = %phone, until = %until, "invite quota exhausted");
                self.log_line(format!("{phone} exhausted its invite quota")).await;
            }
            AccountEnd::QueueEmpty | AccountEnd::NoWorkLeft => {
                self.record_outcome(account.id, AccountOutcome::Finished).await;
            }
            AccountEnd::Dropped(_) | AccountEnd::Cancelled => {}
        }
        match session.disconnect(true).await {
            Ok(Some(blob)) => self.ledger.save_session(account.id, &blob).await?,
            Ok(None) => {}
            Err(err) => {
                warn!(account = %phone, error = %err, "failed to persist session");
            }
        }
        Ok(())
    }

    /// Seeds the dedup set with the target group's current members and
    /// records its member count. Partial seeding is tolerated; invites
    /// to existing members come back as refusals later.
    pub(crate) async fn seed_from_target(
        &self,
        active: &ActiveAccount,
    ) -> Result<usize, LedgerError> {
        let mut offset = 0i32;
        let mut ids = Vec::new();
        let mut total = 0i64;
        loop {
            if self.cancelled() {
                break;
            }
            match active
                .session
                .list_members_page(&active.target_chat, offset, false)
                .await
            {
                Ok(page) => {
                    if page.total > 0 {
                        total = page.total;
                    }
                    if page.is_last() {
                        break;
                    }
                    let fetched = page.members.len();
                    ids.extend(
                        page.members
                            .iter()
                            .filter(|member| !member.bot && !member.deleted)
                            .map(|member| member.user_id),
                    );
                    offset += i32::try_from(fetched).unwrap_or(i32::MAX);
                }
                Err(ProviderError::FloodWait(seconds)) => {
                    self.log_line(format!("flood wait {seconds}s seeding from target"))
                        .await;
                    if self.flood_sleep(seconds).await {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "target member listing incomplete");
                    break;
                }
            }
        }
        let seeded = ids.len();
        self.dedup.seed(ids).await;
        if total > 0 {
            self.ledger.update_member_count(self.target.id, total).await?;
        }
        info!(seeded, total, "seeded dedup set from target members");
        Ok(seeded)
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Sleeps unless cancelled first. Returns `true` when cancelled.
    async fn sleep_cancellable(&self, duration: Duration) -> bool {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            () = tokio::time::sleep(duration) => false,
            _ = cancel.wait_for(|cancelled| *cancelled) => true,
        }
    }

    async fn flood_sleep(&self, seconds: u32) -> bool {
        self.sleep_cancellable(Duration::from_secs(u64::from(seconds))).await
    }

    /// Waits until the wall-clock moment. Returns `false` when cancelled.
    async fn wait_until(&self, at: DateTime<Utc>) -> bool {
        let now = Utc::now();
        if at <= now {
            return true;
        }
        let wait = (at - now).to_std().unwrap_or_default();
        !self.sleep_cancellable(wait).await
    }

    async fn record_outcome(&self, account_id: i64, outcome: AccountOutcome) {
        self.stats.write().await.account_outcome(account_id, outcome);
    }

    async fn log_line(&self, line: String) {
        self.stats.write().await.log(line);
    }

    /// First reason wins; a full channel means one is already pending.
    fn abort(&self, reason: String) {
        if let Err(err) = self.abort_tx.try_send(reason) {
            debug!(error = %err, "abort reason dropped");
        }
    }
}

/// Jittered, doubling backoff for consecutive peer-flood errors.
fn peer_flood_backoff(attempt: u32) -> Duration {
    let (low, high) = PEER_FLOOD_BACKOFF_SECS;
    let base = rand::rng().random_range(low..=high);
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_secs(base.saturating_mul(factor)).min(PEER_FLOOD_BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_flood_backoff_escalates_within_bounds() {
        for _ in 0..50 {
            let first = peer_flood_backoff(1).as_secs();
            assert!((60..=120).contains(&first), "first backoff {first}s");
            let second = peer_flood_backoff(2).as_secs();
            assert!((120..=240).contains(&second), "second backoff {second}s");
        }
    }

    #[test]
    fn test_peer_flood_backoff_is_capped() {
        for _ in 0..20 {
            assert!(peer_flood_backoff(10) <= PEER_FLOOD_BACKOFF_CAP);
        }
    }
}
