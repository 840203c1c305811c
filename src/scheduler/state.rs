//! Shared run state and status reporting.
//!
//! Workers mutate one `RunStats` behind a lock; the orchestrator
//! snapshots it into a `StatusReport` on a coalescing timer so the
//! front end sees periodic summaries instead of an event firehose.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Most recent log lines retained for status payloads.
const LOG_CAP: usize = 20;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Initializing,
    Running,
    Completed,
    Cancelled,
    Aborted,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Aborted)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Where a source group currently is in its scrape lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupRunStatus {
    #[default]
    Pending,
    Scraping,
    Waiting,
    Exhausted,
    Disabled,
}

impl fmt::Display for GroupRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Scraping => "scraping",
            Self::Waiting => "waiting",
            Self::Exhausted => "exhausted",
            Self::Disabled => "disabled",
        };
        f.write_str(label)
    }
}

/// How an account left the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountOutcome {
    /// Worked until the queue had nothing left for it.
    Finished,
    /// Invite quota ran out.
    Exhausted,
    /// Could not sign in, or sign-in was skipped.
    LoginFailed,
    /// Telegram retired the account mid-run.
    Banned,
    /// Dropped for this run (target revoked access, repeated peer floods).
    Dropped,
}

#[derive(Debug, Default)]
struct GroupProgress {
    name: String,
    status: GroupRunStatus,
    active_accounts: usize,
    joined_accounts: HashSet<i64>,
    kicked_accounts: HashSet<i64>,
    users_added: usize,
    users_failed: usize,
}

/// Per-group slice of a status report.
#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub name: String,
    pub status: GroupRunStatus,
    pub active_accounts: usize,
    pub joined_accounts: usize,
    pub kicked_accounts: usize,
    pub users_added: usize,
    pub users_failed: usize,
}

/// Aggregated statistics for one run, shared across workers.
#[derive(Debug)]
pub struct RunStats {
    status: RunStatus,
    started_at: DateTime<Utc>,
    accounts_total: usize,
    accounts_used: HashSet<i64>,
    account_outcomes: HashMap<i64, AccountOutcome>,
    users_processed: HashSet<i64>,
    users_added: usize,
    groups: HashMap<i64, GroupProgress>,
    group_order: Vec<i64>,
    workers_active: usize,
    abort_reason: Option<String>,
    logs: VecDeque<String>,
}

impl RunStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: RunStatus::Idle,
            started_at: Utc::now(),
            accounts_total: 0,
            accounts_used: HashSet::new(),
            account_outcomes: HashMap::new(),
            users_processed: HashSet::new(),
            users_added: 0,
            groups: HashMap::new(),
            group_order: Vec::new(),
            workers_active: 0,
            abort_reason: None,
            logs: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
    }

    pub fn begin(&mut self, accounts_total: usize) {
        self.status = RunStatus::Initializing;
        self.started_at = Utc::now();
        self.accounts_total = accounts_total;
    }

    /// Marks the run aborted. The first recorded reason wins.
    pub fn abort(&mut self, reason: impl Into<String>) {
        self.status = RunStatus::Aborted;
        if self.abort_reason.is_none() {
            self.abort_reason = Some(reason.into());
        }
    }

    #[must_use]
    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    pub fn register_group(&mut self, group_id: i64, name: impl Into<String>) {
        let entry = self.groups.entry(group_id).or_default();
        entry.name = name.into();
        if !self.group_order.contains(&group_id) {
            self.group_order.push(group_id);
        }
    }

    pub fn worker_started(&mut self) {
        self.workers_active += 1;
    }

    pub fn worker_finished(&mut self) {
        self.workers_active = self.workers_active.saturating_sub(1);
    }

    pub fn account_used(&mut self, account_id: i64) {
        self.accounts_used.insert(account_id);
    }

    pub fn account_outcome(&mut self, account_id: i64, outcome: AccountOutcome) {
        self.account_outcomes.insert(account_id, outcome);
    }

    #[must_use]
    pub fn outcome_counts(&self) -> HashMap<AccountOutcome, usize> {
        let mut counts = HashMap::new();
        for outcome in self.account_outcomes.values() {
            *counts.entry(*outcome).or_insert(0) += 1;
        }
        counts
    }

    pub fn set_group_status(&mut self, group_id: i64, status: GroupRunStatus) {
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.status = status;
        }
    }

    pub fn begin_scrape(&mut self, group_id: i64) {
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.status = GroupRunStatus::Scraping;
            group.active_accounts += 1;
        }
    }

    pub fn end_scrape(&mut self, group_id: i64, status: GroupRunStatus) {
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.active_accounts = group.active_accounts.saturating_sub(1);
            group.status = status;
        }
    }

    pub fn group_joined(&mut self, group_id: i64, account_id: i64) {
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.joined_accounts.insert(account_id);
        }
    }

    pub fn group_kicked(&mut self, group_id: i64, account_id: i64) {
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.kicked_accounts.insert(account_id);
        }
    }

    pub fn user_invited(&mut self, group_id: i64, user_id: i64) {
        self.users_processed.insert(user_id);
        self.users_added += 1;
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.users_added += 1;
        }
    }

    pub fn user_refused(&mut self, group_id: i64, user_id: i64) {
        self.users_processed.insert(user_id);
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.users_failed += 1;
        }
    }

    /// Appends a log line, dropping exact repeats and the oldest lines
    /// past the cap.
    pub fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        if self.logs.contains(&line) {
            return;
        }
        if self.logs.len() == LOG_CAP {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatusReport {
        let groups = self
            .group_order
            .iter()
            .filter_map(|id| self.groups.get(id))
            .map(|group| GroupReport {
                name: group.name.clone(),
                status: group.status,
                active_accounts: group.active_accounts,
                joined_accounts: group.joined_accounts.len(),
                kicked_accounts: group.kicked_accounts.len(),
                users_added: group.users_added,
                users_failed: group.users_failed,
            })
            .collect();
        StatusReport {
            status: self.status,
            started_at: self.started_at,
            tasks_active: self.workers_active,
            accounts_used: self.accounts_used.len(),
            accounts_total: self.accounts_total,
            users_processed: self.users_processed.len(),
            users_added: self.users_added,
            groups,
            logs: self.logs.iter().cloned().collect(),
            abort_reason: self.abort_reason.clone(),
        }
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Coalesced status payload pushed to the front end.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub tasks_active: usize,
    pub accounts_used: usize,
    pub accounts_total: usize,
    pub users_processed: usize,
    pub users_added: usize,
    pub groups: Vec<GroupReport>,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Invite run: {} ===", self.status)?;
        writeln!(f, "Workers active:  {}", self.tasks_active)?;
        writeln!(
            f,
            "Accounts used:   {}/{}",
            self.accounts_used, self.accounts_total
        )?;
        writeln!(f, "Users processed: {}", self.users_processed)?;
        writeln!(f, "Users added:     {}", self.users_added)?;
        if let Some(reason) = &self.abort_reason {
            writeln!(f, "Abort reason:    {reason}")?;
        }
        if !self.groups.is_empty() {
            writeln!(f, "Groups:")?;
            for group in &self.groups {
                writeln!(
                    f,
                    "  {} [{}] joined={} kicked={} added={} failed={}",
                    group.name,
                    group.status,
                    group.joined_accounts,
                    group.kicked_accounts,
                    group.users_added,
                    group.users_failed
                )?;
            }
        }
        if !self.logs.is_empty() {
            writeln!(f, "Recent log:")?;
            for line in &self.logs {
                writeln!(f, "  {line}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_deduplicates_and_caps() {
        let mut stats = RunStats::new();
        stats.log("flood wait 30s");
        stats.log("flood wait 30s");
        assert_eq!(stats.snapshot().logs.len(), 1);

        for i in 0..LOG_CAP + 5 {
            stats.log(format!("line {i}"));
        }
        let logs = stats.snapshot().logs;
        assert_eq!(logs.len(), LOG_CAP);
        assert_eq!(logs.last().map(String::as_str), Some("line 24"));
    }

    #[test]
    fn test_joined_accounts_count_distinct_ids() {
        let mut stats = RunStats::new();
        stats.register_group(1, "alpha");
        stats.group_joined(1, 10);
        stats.group_joined(1, 10);
        stats.group_joined(1, 11);
        let report = stats.snapshot();
        assert_eq!(report.groups[0].joined_accounts, 2);
    }

    #[test]
    fn test_invited_and_refused_users_both_count_as_processed() {
        let mut stats = RunStats::new();
        stats.register_group(1, "alpha");
        stats.user_invited(1, 100);
        stats.user_refused(1, 101);
        stats.user_refused(1, 101);
        let report = stats.snapshot();
        assert_eq!(report.users_added, 1);
        assert_eq!(report.users_processed, 2);
        assert_eq!(report.groups[0].users_failed, 2);
    }

    #[test]
    fn test_snapshot_keeps_group_registration_order() {
        let mut stats = RunStats::new();
        stats.register_group(9, "last");
        stats.register_group(1, "first");
        stats.register_group(9, "last");
        let report = stats.snapshot();
        let names: Vec<&str> = report.groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["last", "first"]);
    }

    #[test]
    fn test_first_abort_reason_wins() {
        let mut stats = RunStats::new();
        stats.abort("target link invalid");
        stats.abort("storage failure");
        assert_eq!(stats.abort_reason(), Some("target link invalid"));
        assert!(stats.status().is_terminal());
    }

    #[test]
    fn test_scrape_lifecycle_tracks_active_accounts() {
        let mut stats = RunStats::new();
        stats.register_group(1, "alpha");
        stats.begin_scrape(1);
        assert_eq!(stats.snapshot().groups[0].active_accounts, 1);
        assert_eq!(stats.snapshot().groups[0].status, GroupRunStatus::Scraping);
        stats.end_scrape(1, GroupRunStatus::Waiting);
        assert_eq!(stats.snapshot().groups[0].active_accounts, 0);
        assert_eq!(stats.snapshot().groups[0].status, GroupRunStatus::Waiting);
    }
}
