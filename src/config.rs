//! Configuration management for taskloom
//!
//! Hierarchical configuration with discovery and precedence:
//! environment > file > defaults. Supports TOML configuration files with
//! [engine], [shared], and [commit_log] sections, and records where each
//! effective value came from for status display.
//!
//! Environment variables consumed at the boundary:
//! - `TASKLOOM_MACHINE_ID`: identifier of this machine in shared state
//! - `TASKLOOM_SHARED_ROOT`: shared-state root path
//! - `TASKLOOM_TEST_MODE`: truthy to mark a test-mode process

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

use taskloom_utils::error::{ErrorCategory, UserFriendlyError};

/// Default reconstruction batch size.
pub const DEFAULT_BATCH_SIZE: usize = 32;
/// Batch sizes outside this range are clamped.
pub const BATCH_SIZE_RANGE: std::ops::RangeInclusive<usize> = 1..=256;
/// Default age in days after which commit entries become archive candidates.
pub const DEFAULT_COMPRESSION_AGE_DAYS: u32 = 30;
/// Default retry budget before a failed commit entry is eligible for cleanup.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Unreadable { path: Utf8PathBuf, reason: String },

    #[error("Failed to parse config file {path}: {reason}")]
    Invalid { path: Utf8PathBuf, reason: String },
}

impl UserFriendlyError for ConfigError {
    fn user_message(&self) -> String {
        self.to_string()
    }

    fn suggestions(&self) -> Vec<String> {
        vec![
            "Check the TOML syntax of taskloom.toml".to_string(),
            "Valid sections: [engine], [shared], [commit_log]".to_string(),
        ]
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Input
    }
}

/// Hierarchy-engine settings. These gate diagnostics and scheduling only;
/// they never relax resolution correctness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Exact-prefix resolution is the only method; this flag exists for
    /// diagnostics parity and is true by default.
    pub strict_mode: bool,
    /// Extra per-task resolution logging
    pub debug_mode: bool,
    /// Ignore checksums and rebuild every skeleton
    pub force_rebuild: bool,
    /// Skeletons processed per batch between yield points
    pub batch_size: usize,
    /// Case-insensitive, slash-canonicalized workspace containment filter
    pub workspace_filter: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strict_mode: true,
            debug_mode: false,
            force_rebuild: false,
            batch_size: DEFAULT_BATCH_SIZE,
            workspace_filter: None,
        }
    }
}

/// Shared-state boundary settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedConfig {
    /// This machine's identifier in the commit log and message store
    pub machine_id: String,
    /// Root directory of the shared state; `None` disables both subsystems
    pub shared_root: Option<Utf8PathBuf>,
    pub test_mode: bool,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            machine_id: "local".to_string(),
            shared_root: None,
            test_mode: false,
        }
    }
}

/// Commit-log maintenance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitLogConfig {
    pub compression_age_days: u32,
    pub max_retry_attempts: u32,
    /// Seconds between auto-sync ticks; 0 disables the loop
    pub auto_sync_interval_secs: u64,
}

impl Default for CommitLogConfig {
    fn default() -> Self {
        Self {
            compression_age_days: DEFAULT_COMPRESSION_AGE_DAYS,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            auto_sync_interval_secs: 0,
        }
    }
}

/// Source of a configuration value for attribution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Env,
    ConfigFile(Utf8PathBuf),
    Defaults,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::ConfigFile(path) => write!(f, "config file ({path})"),
            Self::Defaults => write!(f, "defaults"),
        }
    }
}

/// TOML configuration file structure; every field optional so a sparse
/// file overrides only what it names.
#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    engine: Option<TomlEngine>,
    shared: Option<TomlShared>,
    commit_log: Option<TomlCommitLog>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlEngine {
    strict_mode: Option<bool>,
    debug_mode: Option<bool>,
    force_rebuild: Option<bool>,
    batch_size: Option<usize>,
    workspace_filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlShared {
    machine_id: Option<String>,
    shared_root: Option<String>,
    test_mode: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlCommitLog {
    compression_age_days: Option<u32>,
    max_retry_attempts: Option<u32>,
    auto_sync_interval_secs: Option<u64>,
}

/// Effective configuration with source attribution.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub engine: EngineConfig,
    pub shared: SharedConfig,
    pub commit_log: CommitLogConfig,
    /// Setting name → where its effective value came from
    pub source_attribution: HashMap<String, ConfigSource>,
}

impl Config {
    /// Load configuration: defaults, then `taskloom.toml` (explicit path or
    /// working-directory discovery), then environment overrides.
    pub fn load(explicit_path: Option<&Utf8Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let file_path = explicit_path.map(Utf8Path::to_owned).or_else(|| {
            let candidate = Utf8PathBuf::from("taskloom.toml");
            candidate.exists().then_some(candidate)
        });

        if let Some(path) = file_path {
            config.apply_file(&path)?;
        }

        config.apply_env();
        config.engine.batch_size = config
            .engine
            .batch_size
            .clamp(*BATCH_SIZE_RANGE.start(), *BATCH_SIZE_RANGE.end());
        Ok(config)
    }

    fn apply_file(&mut self, path: &Utf8Path) -> Result<(), ConfigError> {
        let content =
            fs::read_to_string(path.as_std_path()).map_err(|e| ConfigError::Unreadable {
                path: path.to_owned(),
                reason: e.to_string(),
            })?;
        let parsed: TomlConfig = toml::from_str(&content).map_err(|e| ConfigError::Invalid {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;

        let source = ConfigSource::ConfigFile(path.to_owned());

        if let Some(engine) = parsed.engine {
            if let Some(v) = engine.strict_mode {
                self.engine.strict_mode = v;
                self.attribute("engine.strict_mode", source.clone());
            }
            if let Some(v) = engine.debug_mode {
                self.engine.debug_mode = v;
                self.attribute("engine.debug_mode", source.clone());
            }
            if let Some(v) = engine.force_rebuild {
                self.engine.force_rebuild = v;
                self.attribute("engine.force_rebuild", source.clone());
            }
            if let Some(v) = engine.batch_size {
                self.engine.batch_size = v;
                self.attribute("engine.batch_size", source.clone());
            }
            if let Some(v) = engine.workspace_filter {
                self.engine.workspace_filter = Some(v);
                self.attribute("engine.workspace_filter", source.clone());
            }
        }

        if let Some(shared) = parsed.shared {
            if let Some(v) = shared.machine_id {
                self.shared.machine_id = v;
                self.attribute("shared.machine_id", source.clone());
            }
            if let Some(v) = shared.shared_root {
                self.shared.shared_root = Some(Utf8PathBuf::from(v));
                self.attribute("shared.shared_root", source.clone());
            }
            if let Some(v) = shared.test_mode {
                self.shared.test_mode = v;
                self.attribute("shared.test_mode", source.clone());
            }
        }

        if let Some(commit_log) = parsed.commit_log {
            if let Some(v) = commit_log.compression_age_days {
                self.commit_log.compression_age_days = v;
                self.attribute("commit_log.compression_age_days", source.clone());
            }
            if let Some(v) = commit_log.max_retry_attempts {
                self.commit_log.max_retry_attempts = v;
                self.attribute("commit_log.max_retry_attempts", source.clone());
            }
            if let Some(v) = commit_log.auto_sync_interval_secs {
                self.commit_log.auto_sync_interval_secs = v;
                self.attribute("commit_log.auto_sync_interval_secs", source);
            }
        }

        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(machine_id) = std::env::var("TASKLOOM_MACHINE_ID")
            && !machine_id.is_empty()
        {
            self.shared.machine_id = machine_id;
            self.attribute("shared.machine_id", ConfigSource::Env);
        }
        if let Ok(shared_root) = std::env::var("TASKLOOM_SHARED_ROOT")
            && !shared_root.is_empty()
        {
            self.shared.shared_root = Some(Utf8PathBuf::from(shared_root));
            self.attribute("shared.shared_root", ConfigSource::Env);
        }
        if let Ok(test_mode) = std::env::var("TASKLOOM_TEST_MODE") {
            self.shared.test_mode = matches!(test_mode.as_str(), "1" | "true" | "yes");
            self.attribute("shared.test_mode", ConfigSource::Env);
        }
    }

    fn attribute(&mut self, key: &str, source: ConfigSource) {
        self.source_attribution.insert(key.to_string(), source);
    }

    /// Attribution for one setting, defaulting to `Defaults`.
    #[must_use]
    pub fn source_of(&self, key: &str) -> ConfigSource {
        self.source_attribution
            .get(key)
            .cloned()
            .unwrap_or(ConfigSource::Defaults)
    }
}
