//! Configuration management for BookChat
//!
//! Configuration is loaded from environment variables. The core never reads the
//! environment itself: `Config` is built once by the binary and narrowed into
//! per-component views (`SigningConfig`, `SyncConfig`, `ArchiveConfig`,
//! `RepoSettings`) that are passed in at construction.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration struct for BookChat
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct Config {
    // Storage
    pub storage_root: PathBuf,
    pub keys_dir: PathBuf,
    pub main_branch: String,
    pub git_author_name: String,
    pub git_author_email: String,
    pub worktree_lock_timeout_seconds: u64,
    pub max_content_bytes: usize,

    // Signing
    pub message_signing_enabled: bool,

    // Sync
    pub sync_enabled: bool,
    pub git_remote_name: String,
    pub git_remote_url: Option<String>,
    pub sync_network_timeout_seconds: u64,
    pub sync_max_attempts: u32,
    pub sync_base_delay_ms: u64,
    pub sync_max_delay_ms: u64,
    pub sync_jitter: bool,
    pub sync_pull_cooldown_seconds: u64,
    pub sync_interval_seconds: u64,
    pub sync_max_workers: usize,

    // Archive
    pub archive_enabled: bool,
    pub archive_max_age_days: u64,
    pub archive_max_branch_bytes: u64,
    pub archive_interval_seconds: u64,

    // Logging
    pub log_level: String,
}

/// Signing switch handed to the key manager and the message store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningConfig {
    pub enabled: bool,
}

/// Repository driver settings.
#[derive(Debug, Clone)]
pub struct RepoSettings {
    pub root: PathBuf,
    pub main_branch: String,
    pub committer_name: String,
    pub committer_email: String,
    pub remote_name: String,
    pub remote_url: Option<String>,
    pub lock_timeout: Duration,
    pub network_timeout: Duration,
}

/// Remote synchronization settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    pub pull_cooldown: Duration,
    pub interval: Duration,
    pub max_workers: usize,
}

/// Archive thresholds and timer period.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub enabled: bool,
    pub max_age: chrono::Duration,
    pub max_branch_bytes: u64,
    pub interval: Duration,
}

fn bookchat_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bookchat")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Storage
            storage_root: bookchat_home().join("repo"),
            keys_dir: bookchat_home().join("keys"),
            main_branch: "main".to_string(),
            git_author_name: "BookChat Bot".to_string(),
            git_author_email: "bot@bookchat.local".to_string(),
            worktree_lock_timeout_seconds: 60,
            max_content_bytes: 65536,

            // Signing
            message_signing_enabled: true,

            // Sync
            sync_enabled: false,
            git_remote_name: "origin".to_string(),
            git_remote_url: None,
            sync_network_timeout_seconds: 30,
            sync_max_attempts: 4,
            sync_base_delay_ms: 250,
            sync_max_delay_ms: 8000,
            sync_jitter: true,
            sync_pull_cooldown_seconds: 5,
            sync_interval_seconds: 60,
            sync_max_workers: 4,

            // Archive
            archive_enabled: true,
            archive_max_age_days: 30,
            archive_max_branch_bytes: 1024 * 1024,
            archive_interval_seconds: 3600,

            // Logging
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup (environment, file, test map).
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let mut config = Self::default();

        // Storage
        if let Some(v) = vars.string("STORAGE_ROOT") {
            config.storage_root = expand_path(&v);
        }
        if let Some(v) = vars.string("KEYS_DIR") {
            config.keys_dir = expand_path(&v);
        }
        if let Some(v) = vars.string("MAIN_BRANCH") {
            config.main_branch = v;
        }
        if let Some(v) = vars.string("GIT_AUTHOR_NAME") {
            config.git_author_name = v;
        }
        if let Some(v) = vars.string("GIT_AUTHOR_EMAIL") {
            config.git_author_email = v;
        }
        config.worktree_lock_timeout_seconds = vars.u64(
            "WORKTREE_LOCK_TIMEOUT_SECONDS",
            config.worktree_lock_timeout_seconds,
        );
        config.max_content_bytes = vars.usize("MAX_CONTENT_BYTES", config.max_content_bytes);

        // Signing
        config.message_signing_enabled =
            vars.bool("MESSAGE_SIGNING_ENABLED", config.message_signing_enabled);

        // Sync
        config.sync_enabled = vars.bool("SYNC_ENABLED", config.sync_enabled);
        if let Some(v) = vars.string("GIT_REMOTE_NAME") {
            config.git_remote_name = v;
        }
        config.git_remote_url = vars.string("GIT_REMOTE_URL");
        config.sync_network_timeout_seconds = vars.u64(
            "SYNC_NETWORK_TIMEOUT_SECONDS",
            config.sync_network_timeout_seconds,
        );
        config.sync_max_attempts = vars.u32("SYNC_MAX_ATTEMPTS", config.sync_max_attempts);
        config.sync_base_delay_ms = vars.u64("SYNC_BASE_DELAY_MS", config.sync_base_delay_ms);
        config.sync_max_delay_ms = vars.u64("SYNC_MAX_DELAY_MS", config.sync_max_delay_ms);
        config.sync_jitter = vars.bool("SYNC_JITTER", config.sync_jitter);
        config.sync_pull_cooldown_seconds = vars.u64(
            "SYNC_PULL_COOLDOWN_SECONDS",
            config.sync_pull_cooldown_seconds,
        );
        config.sync_interval_seconds =
            vars.u64("SYNC_INTERVAL_SECONDS", config.sync_interval_seconds);
        config.sync_max_workers = vars.usize("SYNC_MAX_WORKERS", config.sync_max_workers);

        // Archive
        config.archive_enabled = vars.bool("ARCHIVE_ENABLED", config.archive_enabled);
        config.archive_max_age_days =
            vars.u64("ARCHIVE_MAX_AGE_DAYS", config.archive_max_age_days);
        config.archive_max_branch_bytes =
            vars.u64("ARCHIVE_MAX_BRANCH_BYTES", config.archive_max_branch_bytes);
        config.archive_interval_seconds =
            vars.u64("ARCHIVE_INTERVAL_SECONDS", config.archive_interval_seconds);

        // Logging
        if let Some(v) = vars.string("LOG_LEVEL") {
            config.log_level = v;
        }

        config
    }

    #[must_use]
    pub const fn signing(&self) -> SigningConfig {
        SigningConfig {
            enabled: self.message_signing_enabled,
        }
    }

    #[must_use]
    pub fn repo_settings(&self) -> RepoSettings {
        RepoSettings {
            root: self.storage_root.clone(),
            main_branch: self.main_branch.clone(),
            committer_name: self.git_author_name.clone(),
            committer_email: self.git_author_email.clone(),
            remote_name: self.git_remote_name.clone(),
            remote_url: self.git_remote_url.clone(),
            lock_timeout: Duration::from_secs(self.worktree_lock_timeout_seconds),
            network_timeout: Duration::from_secs(self.sync_network_timeout_seconds.max(1)),
        }
    }

    #[must_use]
    pub fn sync(&self) -> SyncConfig {
        SyncConfig {
            enabled: self.sync_enabled,
            max_attempts: self.sync_max_attempts.max(1),
            base_delay: Duration::from_millis(self.sync_base_delay_ms),
            max_delay: Duration::from_millis(self.sync_max_delay_ms.max(self.sync_base_delay_ms)),
            jitter: self.sync_jitter,
            pull_cooldown: Duration::from_secs(self.sync_pull_cooldown_seconds),
            interval: Duration::from_secs(self.sync_interval_seconds.max(1)),
            max_workers: self.sync_max_workers.max(1),
        }
    }

    #[must_use]
    pub fn archive(&self) -> ArchiveConfig {
        let days = i64::try_from(self.archive_max_age_days).unwrap_or(i64::MAX / 86_400);
        ArchiveConfig {
            enabled: self.archive_enabled,
            max_age: chrono::Duration::days(days.min(365_000)),
            max_branch_bytes: self.archive_max_branch_bytes,
            interval: Duration::from_secs(self.archive_interval_seconds.max(1)),
        }
    }
}

impl RepoSettings {
    /// Settings for a repository at `root` with default identity and timeouts.
    #[must_use]
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        let mut settings = Config::default().repo_settings();
        settings.root = root.into();
        settings
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

// Helper functions for environment variable parsing

struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|s| !s.trim().is_empty())
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        self.string(key).map_or(default, |v| {
            matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
        })
    }

    fn u32(&self, key: &str, default: u32) -> u32 {
        self.string(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn u64(&self, key: &str, default: u64) -> u64 {
        self.string(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        self.string(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }
}
