//! Configuration module for the invite scraper.
//!
//! Handles environment-derived paths and the runtime-mutable run settings
//! (join cadence, invite quotas, filters, worker pool size).

mod settings;

pub use settings::{AppConfig, INVITE_LIMIT_MAX, LastSeenFilter, Settings, SettingsError};
