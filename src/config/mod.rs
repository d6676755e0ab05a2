// src/config/mod.rs
// Layered configuration: CLI/env (resolved by clap in main.rs) > ~/.repopilot/config.toml > defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::{PilotError, Result};
use crate::llm::Effort;

pub const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_GITHUB_URL: &str = "https://api.github.com";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// How repository mutations are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// Commit straight to the active branch
    #[default]
    Direct,
    /// Commit to a working branch and open a pull request at the end of the turn
    Safe,
}

impl std::str::FromStr for DeployMode {
    type Err = PilotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "safe" => Ok(Self::Safe),
            other => Err(PilotError::Config(format!("unknown deploy mode: {other}"))),
        }
    }
}

/// Repository cache tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub tree_ttl_secs: u64,
    pub file_ttl_secs: u64,
    pub search_ttl_secs: u64,
    pub max_entries: usize,
    pub max_file_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tree_ttl_secs: 300,
            file_ttl_secs: 600,
            search_ttl_secs: 300,
            max_entries: 500,
            max_file_bytes: 1024 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn tree_ttl(&self) -> Duration {
        Duration::from_secs(self.tree_ttl_secs)
    }

    pub fn file_ttl(&self) -> Duration {
        Duration::from_secs(self.file_ttl_secs)
    }

    pub fn search_ttl(&self) -> Duration {
        Duration::from_secs(self.search_ttl_secs)
    }
}

/// Bounds on rounds, tool output, and upstream streams
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_rounds_low: u32,
    pub max_rounds_medium: u32,
    pub max_rounds_high: u32,
    pub read_file_max_chars: usize,
    pub tool_result_max_chars: usize,
    pub max_search_results: usize,
    pub max_grep_results: usize,
    pub max_grep_files: usize,
    pub stream_idle_timeout_secs: u64,
    pub tree_prompt_max_entries: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rounds_low: 4,
            max_rounds_medium: 8,
            max_rounds_high: 12,
            read_file_max_chars: 60_000,
            tool_result_max_chars: 12_000,
            max_search_results: 50,
            max_grep_results: 50,
            max_grep_files: 40,
            stream_idle_timeout_secs: 120,
            tree_prompt_max_entries: 400,
        }
    }
}

impl LimitsConfig {
    /// Hard cap on inference rounds for one turn at the given effort
    pub fn max_rounds(&self, effort: Effort) -> u32 {
        let rounds = match effort {
            Effort::Low => self.max_rounds_low,
            Effort::Medium => self.max_rounds_medium,
            Effort::High => self.max_rounds_high,
        };
        rounds.max(1)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

/// Configuration for repopilot
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Server-side inference key, used when a request carries no `x-api-key`
    pub anthropic_api_key: Option<String>,
    /// Server-side GitHub token, used when a request carries no `x-github-token`
    pub github_token: Option<String>,

    pub anthropic_api_url: String,
    pub github_api_url: String,
    pub default_model: String,
    pub deploy_mode: DeployMode,

    pub cache: CacheConfig,
    pub limits: LimitsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            anthropic_api_key: None,
            github_token: None,
            anthropic_api_url: DEFAULT_ANTHROPIC_URL.to_string(),
            github_api_url: DEFAULT_GITHUB_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            deploy_mode: DeployMode::Direct,
            cache: CacheConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Config {
    /// Load config from ~/.repopilot/config.toml, falling back to defaults
    pub fn load() -> Self {
        let path = config_path();
        if !path.exists() {
            return Self::default();
        }

        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable config file");
                Self::default()
            }
        }
    }

    /// Parse a specific config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| PilotError::Config(e.to_string()))
    }

    /// Drop blank keys so an empty env var does not mask the config file
    pub fn normalize(mut self) -> Self {
        self.anthropic_api_key = self.anthropic_api_key.filter(|k| !k.trim().is_empty());
        self.github_token = self.github_token.filter(|k| !k.trim().is_empty());
        self
    }
}

/// Directory holding config.toml and .env
pub fn config_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(".repopilot")
}

/// Get the config file path
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}
