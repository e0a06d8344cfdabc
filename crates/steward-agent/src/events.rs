//! Events streamed to the caller of [`crate::Runner::run`].
//!
//! Backend events are forwarded as they arrive. Every run ends with exactly
//! one terminal event: [`RunEvent::Done`], [`RunEvent::Failed`] or
//! [`RunEvent::Cancelled`].

use serde::{Deserialize, Serialize};
use steward_router::TaskCategory;
use steward_store::{ToolCall, ToolResult};

use crate::error::RunErrorKind;

/// Progress of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A backend was chosen for the next turn.
    BackendSelected {
        backend: String,
        category: TaskCategory,
        turn: u32,
    },

    TextDelta { text: String },

    ThinkingDelta { text: String },

    /// The backend asked for a local tool.
    ToolCallRequested { call: ToolCall },

    /// A result for a tool the backend ran itself.
    ToolResultEcho { result: ToolResult },

    ToolStarted { call_id: String, name: String },

    ToolFinished { call_id: String, is_error: bool },

    /// Older messages were folded into the session summary.
    Compacted { compacted: usize },

    /// Terminal: the backend finished without requesting tools.
    Done {
        text: String,
        summary: RunSummary,
    },

    /// Terminal: the run ended with an error.
    Failed { kind: RunErrorKind, message: String },

    /// Terminal: the caller cancelled the run.
    Cancelled,
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Failed { .. } | Self::Cancelled)
    }
}

/// What a run consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// `None` when the session could not be opened and the run stayed in memory.
    pub session_id: Option<String>,
    /// Backend turns started, including retries.
    pub turns: u32,
    /// Backend ids in the order they were first tried.
    pub backends_tried: Vec<String>,
    pub tool_calls: usize,
    /// Whether any compaction happened during the run.
    pub compacted: bool,
    /// Messages that could not be persisted.
    pub unpersisted: usize,
}
