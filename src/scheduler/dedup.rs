//! Cross-worker deduplication of invited users.
//!
//! One set per run, seeded with the target group's existing members.
//! The check-invite-record sequence runs under a single async lock so
//! two workers racing on the same user can never both send the invite.

use std::collections::HashSet;

use tokio::sync::Mutex;

use crate::telegram::ProviderError;

/// Result of an atomic claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Another worker already handled this user.
    AlreadyProcessed,
    /// The invite went through and the user is now recorded.
    Invited,
}

#[derive(Debug, Default)]
pub struct DedupSet {
    inner: Mutex<HashSet<i64>>,
}

impl DedupSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records user ids without inviting them. Used for the target
    /// group's existing members; re-seeding is a no-op for known ids.
    pub async fn seed<I>(&self, user_ids: I)
    where
        I: IntoIterator<Item = i64>,
    {
        let mut set = self.inner.lock().await;
        set.extend(user_ids);
    }

    pub async fn contains(&self, user_id: i64) -> bool {
        self.inner.lock().await.contains(&user_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Re-checks the set and runs `invite` while still holding the lock,
    /// recording the user on success.
    ///
    /// A user refused for reasons that no other account can fix (privacy
    /// settings, deactivated peer) is recorded as processed too, so no
    /// other worker wastes an attempt on them. Transient failures such
    /// as flood waits leave no record; the caller may retry the same
    /// user, which still counts as a single submission.
    ///
    /// # Errors
    ///
    /// Returns whatever `invite` returned when it failed.
    pub async fn claim_invite<F, Fut>(
        &self,
        user_id: i64,
        invite: F,
    ) -> Result<ClaimOutcome, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), ProviderError>>,
    {
        let mut set = self.inner.lock().await;
        if set.contains(&user_id) {
            return Ok(ClaimOutcome::AlreadyProcessed);
        }
        match invite().await {
            Ok(()) => {
                set.insert(user_id);
                Ok(ClaimOutcome::Invited)
            }
            Err(ProviderError::UserNotInvitable(refusal)) => {
                set.insert(user_id);
                Err(ProviderError::UserNotInvitable(refusal))
            }
            Err(err) => Err(err),
        }
    }
}
