//! Invite Scraper Bot Library
//!
//! A Telegram userbot that moves members from source groups into one
//! target group, spreading the work across a pool of accounts.
//!
//! This crate provides the core functionality for:
//! - Storing accounts and groups in a `SQLite` ledger
//! - Connecting accounts to Telegram via `MTProto`
//! - Scraping source-group members and inviting them under per-account quotas
//! - Driving interactive login and setup through a pluggable front end

pub mod config;
pub mod frontend;
pub mod scheduler;
pub mod store;
pub mod telegram;

#[cfg(feature = "test-support")]
pub mod testing;
