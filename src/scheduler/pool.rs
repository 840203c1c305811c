//! Shared pool of eligible accounts.
//!
//! Accounts are handed out exclusively: a pull removes the entry, and a
//! consumed account is never pushed back. The one exception is the
//! account used for seeding, which returns to the front of the pool
//! with its session and target membership already established.

use std::collections::VecDeque;

use tokio::sync::Mutex;

use crate::store::Account;
use crate::telegram::{AccountSession, GroupChat};

/// An account waiting in the pool, possibly with a live session left
/// over from the seeding phase.
pub struct PooledAccount {
    pub account: Account,
    pub session: Option<Box<dyn AccountSession>>,
    pub target_chat: Option<GroupChat>,
}

impl PooledAccount {
    #[must_use]
    pub fn new(account: Account) -> Self {
        Self {
            account,
            session: None,
            target_chat: None,
        }
    }
}

impl std::fmt::Debug for PooledAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledAccount")
            .field("account_id", &self.account.id)
            .field("primed", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct AccountPool {
    entries: Mutex<VecDeque<PooledAccount>>,
    total: usize,
}

impl AccountPool {
    #[must_use]
    pub fn new(accounts: Vec<Account>) -> Self {
        let total = accounts.len();
        let entries = accounts.into_iter().map(PooledAccount::new).collect();
        Self {
            entries: Mutex::new(entries),
            total,
        }
    }

    /// Accounts the pool started with, for `accounts_total` reporting.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    pub async fn remaining(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Pulls the next account. Returning `None` means every account has
    /// been consumed and the worker should wind down.
    pub async fn pull(&self) -> Option<PooledAccount> {
        self.entries.lock().await.pop_front()
    }

    /// Returns a primed account to the front of the pool so its live
    /// session is the first one reused.
    pub async fn push_primed(&self, entry: PooledAccount) {
        self.entries.lock().await.push_front(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: i64) -> Account {
        Account {
            id,
            api_id: 12345,
            api_hash: "hash".into(),
            phone: format!("+1555000{id:04}"),
            name: format!("acct-{id}"),
            session_blob: None,
            invites_remaining: 10,
            quota_reset_at: None,
            authenticated: true,
            deactivated: false,
            details: None,
        }
    }

    #[tokio::test]
    async fn test_pull_is_exclusive_and_ordered() {
        let pool = AccountPool::new(vec![account(1), account(2)]);
        assert_eq!(pool.total(), 2);
        assert_eq!(pool.pull().await.unwrap().account.id, 1);
        assert_eq!(pool.pull().await.unwrap().account.id, 2);
        assert!(pool.pull().await.is_none());
        assert_eq!(pool.total(), 2);
    }

    #[tokio::test]
    async fn test_primed_account_is_pulled_first() {
        let pool = AccountPool::new(vec![account(1), account(2)]);
        let seeded = pool.pull().await.unwrap();
        pool.push_primed(seeded).await;
        assert_eq!(pool.remaining().await, 2);
        assert_eq!(pool.pull().await.unwrap().account.id, 1);
    }
}
