//! # steward-agent
//!
//! The iteration loop of the Steward agent.
//!
//! ```text
//!  RunRequest ──► Runner ──► ModelRouter ──► InferenceBackend (stream)
//!                   │                              │
//!                   │◄──────── BackendEvent ───────┘
//!                   │
//!                   ├──► ToolExecutor
//!                   ├──► SessionStore (every step)
//!                   ├──► MemoryQueue (best effort, after the final answer)
//!                   └──► RunEvent ──► caller
//! ```
//!
//! Wire clients for concrete providers, tool implementations and prompt
//! composition live outside this crate and plug in through
//! [`InferenceBackend`], [`ToolAdapter`] / [`ToolExecutor`] and the system
//! prompt field of [`RunRequest`].

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod llm;
pub mod memory;
pub mod runtime;
pub mod tools;

pub use config::{RunnerConfig, StewardConfig, StoreConfig};
pub use error::{AgentError, Result, RunErrorKind};
pub use events::{RunEvent, RunSummary};
pub use llm::{
    BackendError, BackendEvent, BackendRegistry, EventStream, InferenceBackend, StreamRequest,
    ToolDefinition,
};
pub use memory::{
    HeuristicExtractor, MemoryEntry, MemoryExtractor, MemoryJob, MemoryQueue, MemoryQueueConfig,
    MemoryQueueHandle, MemoryStats, MemoryStore,
};
pub use runtime::{RunRequest, Runner};
pub use tools::{NoTools, ToolAdapter, ToolExecutor, ToolSet};
