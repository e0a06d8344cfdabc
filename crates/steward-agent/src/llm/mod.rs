//! Inference backend integration.
//!
//! - [`types`] -- request, tool definition and stream event types.
//! - [`backend`] -- the [`InferenceBackend`] contract, error classification
//!   and the provider registry.
//!
//! Concrete wire clients live outside this crate.

pub mod backend;
pub mod types;

pub use backend::{BackendError, BackendRegistry, InferenceBackend};
pub use types::{BackendEvent, EventStream, StreamRequest, ToolDefinition};
