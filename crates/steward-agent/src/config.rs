//! TOML configuration.
//!
//! ```toml
//! [runner]
//! max_turns = 100
//! max_context_tokens = 100000
//!
//! [store]
//! path = "steward.db"
//!
//! [[backends]]
//! id = "anthropic/sonnet"
//! api_key_env = "ANTHROPIC_API_KEY"
//! tags = ["smart"]
//!
//! [routes.default]
//! primary = "anthropic/sonnet"
//! fallbacks = []
//! ```
//!
//! Every section is optional and falls back to its defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use steward_router::{BackendCatalog, BackendConfig, ClassifierConfig, CooldownPolicy, Route};

use crate::error::{AgentError, Result};
use crate::memory::MemoryQueueConfig;

/// `[runner]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Backend turns per run before giving up.
    pub max_turns: u32,
    /// Live messages loaded into each context.
    pub history_limit: u32,
    /// Estimated token budget that triggers proactive compaction.
    pub max_context_tokens: usize,
    /// Newest messages whose tool results are never truncated.
    pub keep_full_tool_results: usize,
    /// Characters kept of older tool results.
    pub tool_result_char_cap: usize,
    /// Default system prompt, used when a request carries none.
    pub system_prompt: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_turns: 100,
            history_limit: 50,
            max_context_tokens: 100_000,
            keep_full_tool_results: 4,
            tool_result_char_cap: 2_000,
            system_prompt: None,
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Live messages left in place by a compaction.
    pub keep_recent: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("steward.db"),
            keep_recent: steward_store::DEFAULT_KEEP_RECENT,
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StewardConfig {
    pub runner: RunnerConfig,
    pub store: StoreConfig,
    pub cooldown: CooldownPolicy,
    pub classifier: ClassifierConfig,
    pub memory: MemoryQueueConfig,
    pub backends: Vec<BackendConfig>,
    /// Category name or `default` → route.
    pub routes: BTreeMap<String, Route>,
}

impl StewardConfig {
    /// Read and parse a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| AgentError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::info!(
            path = %path.display(),
            backends = config.backends.len(),
            routes = config.routes.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Snapshot the backend section, resolving credentials from the
    /// process environment.
    pub fn catalog(&self) -> Result<BackendCatalog> {
        Ok(BackendCatalog::from_config(&self.backends, &self.routes)?)
    }

    fn validate(&self) -> Result<()> {
        if self.runner.max_turns == 0 {
            return Err(AgentError::Config {
                reason: "runner.max_turns must be at least 1".into(),
            });
        }
        if self.cooldown.base_secs > self.cooldown.ceiling_secs {
            return Err(AgentError::Config {
                reason: format!(
                    "cooldown.base_secs ({}) exceeds cooldown.ceiling_secs ({})",
                    self.cooldown.base_secs, self.cooldown.ceiling_secs
                ),
            });
        }
        Ok(())
    }
}
