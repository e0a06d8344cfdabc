//! Tool execution contract.
//!
//! The runner only sees [`ToolExecutor`]: a catalog of definitions and an
//! `execute` that never fails, because a failed tool is ordinary
//! conversational content for the backend. [`ToolSet`] builds an executor
//! out of [`ToolAdapter`]s, each owning a group of tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use steward_store::{ToolCall, ToolResult};

use crate::error::Result;
use crate::llm::ToolDefinition;

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// What the runner calls for each requested tool.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tools advertised to the backend.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Run one call. All failures are reported through
    /// [`ToolResult::is_error`].
    async fn execute(&self, call: &ToolCall) -> ToolResult;
}

/// Executor with no tools. Any call is answered with an error result.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn execute(&self, call: &ToolCall) -> ToolResult {
        ToolResult::error(&call.id, format!("Error: unknown tool `{}`", call.name))
    }
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

/// A group of related tools (filesystem, shell, web, ...).
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Stable identifier used in logs.
    fn adapter_id(&self) -> &str;

    fn tool_definitions(&self) -> Vec<ToolDefinition>;

    async fn execute(&self, tool_name: &str, input: Value) -> Result<String>;
}

/// [`ToolExecutor`] dispatching to the adapter that declares the tool.
#[derive(Clone, Default)]
pub struct ToolSet {
    adapters: Vec<Arc<dyn ToolAdapter>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ToolAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    fn adapter_for(&self, tool_name: &str) -> Option<&Arc<dyn ToolAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.tool_definitions().iter().any(|d| d.name == tool_name))
    }
}

#[async_trait]
impl ToolExecutor for ToolSet {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.adapters
            .iter()
            .flat_map(|a| a.tool_definitions())
            .collect()
    }

    async fn execute(&self, call: &ToolCall) -> ToolResult {
        let Some(adapter) = self.adapter_for(&call.name) else {
            tracing::warn!(tool = %call.name, id = %call.id, "unknown tool requested");
            return ToolResult::error(&call.id, format!("Error: unknown tool `{}`", call.name));
        };

        tracing::debug!(
            tool = %call.name,
            id = %call.id,
            adapter = adapter.adapter_id(),
            "executing tool"
        );
        match adapter.execute(&call.name, call.input.clone()).await {
            Ok(content) => ToolResult::success(&call.id, content),
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "tool execution failed");
                ToolResult::error(&call.id, format!("Error: {e}"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
