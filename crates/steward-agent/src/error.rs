//! Agent error types.
//!
//! Every failure a run can end with is an [`AgentError`]; callers that only
//! need the coarse outcome use [`AgentError::kind`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use steward_router::TaskCategory;

use crate::llm::BackendError;

/// Unified error type for the agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Run errors ----------------------------------------------------------
    /// Every candidate backend is excluded, cooling down or unconfigured.
    #[error("no backend available for {category} task")]
    NoBackendAvailable { category: TaskCategory },

    /// The backend still reported a context overflow after compaction.
    #[error("context overflow on {backend} persisted after compaction")]
    ContextOverflow { backend: String },

    /// The loop ran out of turns before the backend stopped calling tools.
    #[error("task too long: exceeded {max_turns} turns")]
    MaxTurnsExceeded { max_turns: u32 },

    /// A backend failed in a way that is not recovered by failover.
    #[error("backend {backend} failed: {source}")]
    Backend {
        backend: String,
        #[source]
        source: BackendError,
    },

    /// The caller cancelled the run.
    #[error("run cancelled")]
    Cancelled,

    // -- Tool errors ---------------------------------------------------------
    /// A tool adapter reported a failure. Converted into an error result
    /// before it reaches the backend.
    #[error("tool `{tool_name}` failed: {reason}")]
    ToolFailed { tool_name: String, reason: String },

    /// Memory extraction or storage failed. Logged by the memory queue only.
    #[error("memory extraction failed: {reason}")]
    Memory { reason: String },

    // -- Configuration errors ------------------------------------------------
    #[error("config error: {reason}")]
    Config { reason: String },

    #[error("cannot read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // -- Upstream crate errors -----------------------------------------------
    #[error("store error: {0}")]
    Store(#[from] steward_store::StoreError),

    #[error("router error: {0}")]
    Router(#[from] steward_router::RouterError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of how a run ended badly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// Nothing usable to run on; not retried.
    Configuration,
    /// Compaction did not bring the context under the backend's limit.
    ContextOverflow,
    /// Distinct from generic failure so callers can say "task too long".
    MaxTurnsExceeded,
    Backend,
    Cancelled,
}

impl AgentError {
    pub fn kind(&self) -> RunErrorKind {
        match self {
            Self::NoBackendAvailable { .. }
            | Self::Config { .. }
            | Self::ConfigRead { .. }
            | Self::ConfigParse(_)
            | Self::Router(_) => RunErrorKind::Configuration,
            Self::ContextOverflow { .. } => RunErrorKind::ContextOverflow,
            Self::MaxTurnsExceeded { .. } => RunErrorKind::MaxTurnsExceeded,
            Self::Cancelled => RunErrorKind::Cancelled,
            Self::Backend { .. }
            | Self::ToolFailed { .. }
            | Self::Memory { .. }
            | Self::Store(_)
            | Self::Json(_) => RunErrorKind::Backend,
        }
    }
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;
