//! Wire-independent request and event types for inference backends.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use steward_store::{Message, ToolCall, ToolResult};
use tokio_util::sync::CancellationToken;

use super::backend::BackendError;

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

/// A tool definition exposed to the backend so it knows what it may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,

    /// Human-readable description of what the tool does.
    pub description: String,

    /// JSON Schema describing the tool's input parameters.
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Everything a backend needs for one streamed turn.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Model part of the selected backend id.
    pub model: String,

    /// Sanitized context, summary first when the session has one.
    pub messages: Vec<Message>,

    pub tools: Vec<ToolDefinition>,

    /// Opaque prefix supplied by the caller.
    pub system_prompt: Option<String>,

    /// Ask for extended reasoning output. Only set for backends that
    /// declare support.
    pub extended_reasoning: bool,

    /// Fires when the caller abandons the run. Implementations should stop
    /// producing events promptly.
    pub cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Streaming events
// ---------------------------------------------------------------------------

/// One event of a backend's response stream.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// A chunk of assistant text.
    TextDelta(String),

    /// A chunk of reasoning output. Forwarded, never persisted.
    ThinkingDelta(String),

    /// The backend wants a local tool run.
    ToolCall(ToolCall),

    /// A tool the backend executed itself, echoed for display.
    ToolResult(ToolResult),

    /// The stream failed. No further events follow.
    Error(BackendError),

    /// The response is complete.
    Done,
}

/// Stream returned by [`super::InferenceBackend::stream`].
pub type EventStream = BoxStream<'static, BackendEvent>;
