//! Run orchestration: initialization, seeding, worker supervision.
//!
//! A run moves Idle -> Initializing -> Running and ends Completed,
//! Cancelled or Aborted. The orchestrator owns the shared structures,
//! seeds the dedup set from the target group, spawns the workers and
//! supervises them while a background task pushes coalesced status
//! snapshots to the front end.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::frontend::FrontendLink;
use crate::store::{Ledger, LedgerError};
use crate::telegram::SessionConnector;

use super::dedup::DedupSet;
use super::pool::AccountPool;
use super::queue::GroupQueue;
use super::quota::QuotaPolicy;
use super::state::{RunStats, RunStatus, StatusReport};
use super::worker::Worker;

/// Floor for the status push period.
const MIN_STATUS_INTERVAL_MS: u64 = 250;

/// Whether a run happens once or repeats on a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Once,
    Every(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Drives complete invite runs against one ledger and one Telegram
/// connector.
pub struct Orchestrator {
    ledger: Arc<dyn Ledger>,
    connector: Arc<dyn SessionConnector>,
    settings: Settings,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        connector: Arc<dyn SessionConnector>,
        settings: Settings,
    ) -> Self {
        Self {
            ledger,
            connector,
            settings,
        }
    }

    /// Runs once, or repeats on the configured period until cancelled.
    ///
    /// # Errors
    ///
    /// Fails when the ledger cannot be read or written while a run is
    /// being set up.
    pub async fn run_with_mode(
        &self,
        mode: RunMode,
        link: Arc<FrontendLink>,
        cancel: watch::Receiver<bool>,
    ) -> Result<StatusReport, RunError> {
        loop {
            let report = self.run(Arc::clone(&link), cancel.clone()).await?;
            let RunMode::Every(period) = mode else {
                return Ok(report);
            };
            if report.status == RunStatus::Cancelled {
                return Ok(report);
            }
            info!(period_secs = period.as_secs(), "next run scheduled");
            let mut cancel = cancel.clone();
            tokio::select! {
                () = tokio::time::sleep(period) => {}
                _ = cancel.wait_for(|cancelled| *cancelled) => return Ok(report),
            }
        }
    }

    /// Executes one complete run.
    ///
    /// # Errors
    ///
    /// Fails when the ledger cannot be read or written during
    /// initialization or seeding. Failures inside workers abort the run
    /// and surface in the returned report instead.
    pub async fn run(
        &self,
        link: Arc<FrontendLink>,
        external_cancel: watch::Receiver<bool>,
    ) -> Result<StatusReport, RunError> {
        let stats = Arc::new(RwLock::new(RunStats::new()));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (abort_tx, mut abort_rx) = mpsc::channel::<String>(4);

        // Bridge the caller's cancellation signal into the run.
        let forwarder = tokio::spawn({
            let mut external = external_cancel;
            let cancel_tx = cancel_tx.clone();
            async move {
                if external.wait_for(|cancelled| *cancelled).await.is_ok() {
                    let _ = cancel_tx.send(true);
                }
            }
        });

        // Status snapshots flow on a fixed beat from init to finish.
        let pusher = tokio::spawn({
            let stats = Arc::clone(&stats);
            let link = Arc::clone(&link);
            let period = Duration::from_millis(
                self.settings.status_interval_ms.max(MIN_STATUS_INTERVAL_MS),
            );
            async move {
                let mut ticker = interval(period);
                loop {
                    ticker.tick().await;
                    link.push_status(stats.read().await.snapshot());
                }
            }
        });

        let outcome = self
            .run_inner(&stats, &link, &cancel_tx, cancel_rx, abort_tx, &mut abort_rx)
            .await;

        forwarder.abort();
        pusher.abort();

        let report = match outcome {
            Ok(report) => report,
            Err(err) => {
                link.finished(stats.read().await.snapshot()).await;
                return Err(err);
            }
        };
        link.push_status(report.clone());
        link.finished(report.clone()).await;
        Ok(report)
    }

    async fn run_inner(
        &self,
        stats: &Arc<RwLock<RunStats>>,
        link: &Arc<FrontendLink>,
        cancel_tx: &watch::Sender<bool>,
        cancel_rx: watch::Receiver<bool>,
        abort_tx: mpsc::Sender<String>,
        abort_rx: &mut mpsc::Receiver<String>,
    ) -> Result<StatusReport, RunError> {
        let now = Utc::now();
        let accounts = self.ledger.list_eligible_accounts(now).await?;
        let target = self.ledger.get_target_group().await?;
        let sources = self.ledger.list_enabled_source_groups().await?;

        stats.write().await.begin(accounts.len());

        let Some(target) = target else {
            return Ok(Self::abort_early(stats, "no target group configured").await);
        };
        if accounts.is_empty() {
            return Ok(Self::abort_early(stats, "no eligible accounts").await);
        }
        if sources.is_empty() {
            return Ok(Self::abort_early(stats, "no enabled source groups").await);
        }
        info!(
            accounts = accounts.len(),
            groups = sources.len(),
            target = %target.display_name(),
            "initializing run"
        );
        {
            let mut stats = stats.write().await;
            for source in &sources {
                stats.register_group(source.id, source.display_name());
            }
        }

        let pool = Arc::new(AccountPool::new(accounts));
        let queue = Arc::new(GroupQueue::new(sources, now));
        let dedup = Arc::new(DedupSet::new());
        let policy = QuotaPolicy::from_settings(&self.settings);

        let build_worker = |id: usize| Worker {
            id,
            ledger: Arc::clone(&self.ledger),
            connector: Arc::clone(&self.connector),
            pool: Arc::clone(&pool),
            queue: Arc::clone(&queue),
            dedup: Arc::clone(&dedup),
            stats: Arc::clone(stats),
            link: Arc::clone(link),
            policy: policy.clone(),
            settings: self.settings.clone(),
            target: target.clone(),
            cancel: cancel_rx.clone(),
            abort_tx: abort_tx.clone(),
        };

        // Seed the dedup set with one account. Candidates that fail are
        // consumed; the one that succeeds returns to the pool with its
        // session and target membership intact.
        let seeder = build_worker(0);
        let mut seeded = false;
        while let Some(pooled) = pool.pull().await {
            if *cancel_tx.borrow() {
                break;
            }
            if let Some(active) = seeder.activate(pooled).await? {
                seeder.seed_from_target(&active).await?;
                stats.write().await.account_used(active.account.id);
                pool.push_primed(active.into_pooled()).await;
                seeded = true;
                break;
            }
            // A candidate can fail in a way that dooms the whole run,
            // an invalid target link for instance.
            if !abort_rx.is_empty() {
                break;
            }
        }
        if let Ok(reason) = abort_rx.try_recv() {
            stats.write().await.abort(reason);
        }
        if stats.read().await.status() == RunStatus::Aborted {
            warn!("run aborted during initialization");
            return Ok(stats.read().await.snapshot());
        }
        if *cancel_tx.borrow() {
            return Ok(Self::finalize(stats, RunStatus::Cancelled).await);
        }
        if !seeded {
            return Ok(Self::abort_early(stats, "no account could join the target group").await);
        }

        let worker_count = self.settings.worker_count(pool.remaining().await);
        stats.write().await.set_status(RunStatus::Running);
        info!(workers = worker_count, "run started");

        let mut workers = JoinSet::new();
        for id in 1..=worker_count {
            workers.spawn(build_worker(id).run());
        }

        loop {
            tokio::select! {
                Some(reason) = abort_rx.recv() => {
                    error!(reason = %reason, "run aborted");
                    stats.write().await.abort(reason);
                    let _ = cancel_tx.send(true);
                }
                joined = workers.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(err)) => {
                        error!(error = %err, "worker task failed");
                        stats.write().await.abort(format!("worker task failed: {err}"));
                        let _ = cancel_tx.send(true);
                    }
                    None => break,
                }
            }
        }
        // A worker can abort and exit in the same breath; pick up
        // reasons that raced the join.
        while let Ok(reason) = abort_rx.try_recv() {
            stats.write().await.abort(reason);
        }

        let fallback = if *cancel_tx.borrow() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        let report = Self::finalize(stats, fallback).await;
        info!(
            status = %report.status,
            users_added = report.users_added,
            users_processed = report.users_processed,
            "run finished"
        );
        Ok(report)
    }

    async fn abort_early(stats: &Arc<RwLock<RunStats>>, reason: &str) -> StatusReport {
        warn!(reason, "run aborted during initialization");
        let mut stats = stats.write().await;
        stats.abort(reason);
        stats.snapshot()
    }

    /// Applies the terminal status unless an abort already claimed it.
    async fn finalize(stats: &Arc<RwLock<RunStats>>, fallback: RunStatus) -> StatusReport {
        let mut stats = stats.write().await;
        if stats.status() != RunStatus::Aborted {
            stats.set_status(fallback);
        }
        stats.snapshot()
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
