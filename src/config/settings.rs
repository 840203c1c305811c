//! Application settings and environment configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Invite quota values are always clamped to this range.
pub const INVITE_LIMIT_MAX: u32 = 50;

/// Environment-derived paths and connection options.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the SQLite account/group ledger.
    pub database_path: PathBuf,

    /// Directory holding per-account session files.
    pub sessions_dir: PathBuf,

    /// Optional SOCKS5 proxy URL for provider connections.
    pub proxy_url: Option<String>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("scraper.db")
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("sessions")
}

impl AppConfig {
    /// Creates configuration from environment variables.
    ///
    /// Recognizes `SCRAPER_DB_PATH`, `SCRAPER_SESSIONS_DIR` and `PROXY_URL`;
    /// all are optional.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("SCRAPER_DB_PATH")
                .map_or_else(|_| default_database_path(), PathBuf::from),
            sessions_dir: std::env::var("SCRAPER_SESSIONS_DIR")
                .map_or_else(|_| default_sessions_dir(), PathBuf::from),
            proxy_url: std::env::var("PROXY_URL").ok().filter(|v| !v.is_empty()),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            sessions_dir: default_sessions_dir(),
            proxy_url: None,
        }
    }
}

/// How far back a member's last-seen status may lie before the member is
/// skipped. `Off` disables the filter entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LastSeenFilter {
    Off,
    #[default]
    Recent,
    Week,
    Month,
}

impl LastSeenFilter {
    /// Maximum allowed age of the last-seen timestamp in days, or `None`
    /// when the filter is disabled.
    #[must_use]
    pub fn max_age_days(self) -> Option<i64> {
        match self {
            Self::Off => None,
            Self::Recent => Some(1),
            Self::Week => Some(7),
            Self::Month => Some(30),
        }
    }
}

/// Runtime-mutable run settings, persisted as JSON.
///
/// The orchestrator takes a snapshot at run start; edits apply to
/// subsequently-scheduled work, never retroactively to in-flight workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Minimum interval between joins of the *same* group, in seconds.
    #[serde(default = "default_join_interval")]
    pub join_interval_secs: u64,

    /// Random jitter added on top of the join interval, in seconds.
    #[serde(default = "default_join_jitter")]
    pub join_jitter_secs: u64,

    /// Invite quota ceiling per account per reset window.
    #[serde(default = "default_invite_limit")]
    pub invite_limit: u32,

    /// Downward spread when sampling a fresh quota (`ceiling - spread ..= ceiling`).
    #[serde(default = "default_invite_spread")]
    pub invite_limit_spread: u32,

    /// Days until an exhausted quota replenishes.
    #[serde(default = "default_limit_reset_days")]
    pub limit_reset_days: u32,

    /// Last-seen recency filter applied to scraped members.
    #[serde(default)]
    pub last_seen_filter: LastSeenFilter,

    /// Upper bound on concurrently-running workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Minimum pause between invite calls on one account, in seconds.
    #[serde(default = "default_invite_pause")]
    pub invite_pause_secs: u64,

    /// Random jitter added to the invite pause, in seconds.
    #[serde(default = "default_invite_pause_jitter")]
    pub invite_pause_jitter_secs: u64,

    /// Delay range between member-list pages, in milliseconds.
    #[serde(default = "default_page_delay_min")]
    pub page_delay_min_ms: u64,
    #[serde(default = "default_page_delay_max")]
    pub page_delay_max_ms: u64,

    /// How often coalesced status updates are pushed, in milliseconds.
    #[serde(default = "default_status_interval")]
    pub status_interval_ms: u64,

    /// Pause between passes in repeating-run mode, in hours.
    #[serde(default = "default_repeat_interval")]
    pub repeat_interval_hours: u64,

    /// Tunnel provider connections through the configured proxy.
    #[serde(default)]
    pub use_proxy: bool,

    /// Log level for the application.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_join_interval() -> u64 {
    60
}

fn default_join_jitter() -> u64 {
    15
}

fn default_invite_limit() -> u32 {
    35
}

fn default_invite_spread() -> u32 {
    15
}

fn default_limit_reset_days() -> u32 {
    1
}

fn default_max_workers() -> usize {
    5
}

fn default_invite_pause() -> u64 {
    60
}

fn default_invite_pause_jitter() -> u64 {
    60
}

fn default_page_delay_min() -> u64 {
    300
}

fn default_page_delay_max() -> u64 {
    1000
}

fn default_status_interval() -> u64 {
    2000
}

fn default_repeat_interval() -> u64 {
    24
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            join_interval_secs: default_join_interval(),
            join_jitter_secs: default_join_jitter(),
            invite_limit: default_invite_limit(),
            invite_limit_spread: default_invite_spread(),
            limit_reset_days: default_limit_reset_days(),
            last_seen_filter: LastSeenFilter::default(),
            max_workers: default_max_workers(),
            invite_pause_secs: default_invite_pause(),
            invite_pause_jitter_secs: default_invite_pause_jitter(),
            page_delay_min_ms: default_page_delay_min(),
            page_delay_max_ms: default_page_delay_max(),
            status_interval_ms: default_status_interval(),
            repeat_interval_hours: default_repeat_interval(),
            use_proxy: false,
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    /// Loads settings from a JSON file, falling back to defaults when the
    /// file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let mut settings: Self = serde_json::from_str(&raw)?;
        settings.clamp();
        Ok(settings)
    }

    /// Persists settings as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Applies a new invite ceiling, clamped to the allowed range.
    pub fn set_invite_limit(&mut self, limit: u32) {
        self.invite_limit = limit.min(INVITE_LIMIT_MAX);
        self.invite_limit_spread = self.invite_limit_spread.min(self.invite_limit);
    }

    /// Number of workers to spawn for a pool of `accounts` accounts.
    #[must_use]
    pub fn worker_count(&self, accounts: usize) -> usize {
        accounts.min(self.max_workers).max(1)
    }

    fn clamp(&mut self) {
        self.invite_limit = self.invite_limit.min(INVITE_LIMIT_MAX);
        self.invite_limit_spread = self.invite_limit_spread.min(self.invite_limit);
        if self.page_delay_max_ms < self.page_delay_min_ms {
            self.page_delay_max_ms = self.page_delay_min_ms;
        }
        if self.max_workers == 0 {
            self.max_workers = default_max_workers();
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.join_interval_secs, 60);
        assert_eq!(settings.invite_limit, 35);
        assert_eq!(settings.limit_reset_days, 1);
        assert_eq!(settings.last_seen_filter, LastSeenFilter::Recent);
    }

    #[test]
    fn test_limit_clamped_to_ceiling() {
        let mut settings = Settings::default();
        settings.set_invite_limit(200);
        assert_eq!(settings.invite_limit, INVITE_LIMIT_MAX);
    }

    #[test]
    fn test_spread_never_exceeds_limit() {
        let mut settings = Settings::default();
        settings.set_invite_limit(10);
        assert!(settings.invite_limit_spread <= settings.invite_limit);
    }

    #[test]
    fn test_worker_count_capped_by_accounts() {
        let settings = Settings::default();
        assert_eq!(settings.worker_count(2), 2);
        assert_eq!(settings.worker_count(20), settings.max_workers);
        assert_eq!(settings.worker_count(0), 1);
    }

    #[test]
    fn test_last_seen_days() {
        assert_eq!(LastSeenFilter::Off.max_age_days(), None);
        assert_eq!(LastSeenFilter::Recent.max_age_days(), Some(1));
        assert_eq!(LastSeenFilter::Week.max_age_days(), Some(7));
        assert_eq!(LastSeenFilter::Month.max_age_days(), Some(30));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let path = Path::new("definitely-not-here/settings.json");
        let settings = Settings::load(path).unwrap();
        assert_eq!(settings.invite_limit, default_invite_limit());
    }
}
