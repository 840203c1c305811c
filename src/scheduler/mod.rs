//! Run orchestration.
//!
//! Coordinates accounts, source groups and invite quotas for one
//! scraping run: a bounded worker pool pulls accounts exclusively,
//! groups rotate through a shared queue keyed by join cadence, and a
//! global dedup set guarantees each user is submitted at most once.

mod dedup;
mod filter;
mod pool;
mod queue;
mod quota;
mod runner;
mod state;
mod worker;

pub use dedup::{ClaimOutcome, DedupSet};
pub use filter::member_invitable;
pub use pool::{AccountPool, PooledAccount};
pub use queue::{GroupQueue, QueuedGroup};
pub use quota::QuotaPolicy;
pub use runner::{Orchestrator, RunError, RunMode};
pub use state::{AccountOutcome, GroupReport, GroupRunStatus, RunStats, RunStatus, StatusReport};
