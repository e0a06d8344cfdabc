//! The inference backend contract and the provider registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::types::{EventStream, StreamRequest};

// ---------------------------------------------------------------------------
// InferenceBackend
// ---------------------------------------------------------------------------

/// One provider's streaming client.
///
/// A single implementation serves every model of its provider; the model
/// is chosen per request through [`StreamRequest::model`].
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Provider name, the part of a backend id before the `/`.
    fn provider(&self) -> &str;

    /// Start a streamed turn. Failures before the first event are returned
    /// as `Err`; failures afterwards arrive as [`super::BackendEvent::Error`].
    async fn stream(&self, request: StreamRequest) -> Result<EventStream, BackendError>;
}

// ---------------------------------------------------------------------------
// BackendError
// ---------------------------------------------------------------------------

/// Backend failure, classified by how the runner recovers from it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// HTTP 429 or a provider quota / overload message.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Credentials rejected or expired.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// The request does not fit the model's context window.
    #[error("context window exceeded: {message}")]
    ContextOverflow { message: String },

    /// Anything else.
    #[error("{message}")]
    Other { message: String },
}

const OVERFLOW_MARKERS: &[&str] = &[
    "context length",
    "context_length_exceeded",
    "context window",
    "maximum context",
    "prompt is too long",
    "too many tokens",
    "input is too long",
];

const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "rate_limit",
    "rate limit",
    "too many requests",
    "quota",
    "throttl",
    "overloaded",
    "capacity",
];

const AUTH_MARKERS: &[&str] = &[
    "401",
    "unauthorized",
    "authentication_error",
    "invalid api key",
    "invalid_api_key",
    "token has expired",
    "403",
    "forbidden",
    "permission_denied",
];

impl BackendError {
    /// Classify a provider error message.
    ///
    /// Overflow is checked first because overflow messages often mention
    /// token counts that look like other codes.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        let hits = |markers: &[&str]| markers.iter().any(|m| lowered.contains(m));

        if hits(OVERFLOW_MARKERS) {
            Self::ContextOverflow { message }
        } else if hits(RATE_LIMIT_MARKERS) {
            Self::RateLimited {
                message,
                retry_after: None,
            }
        } else if hits(AUTH_MARKERS) {
            Self::Auth { message }
        } else {
            Self::Other { message }
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Recovered by quarantining the backend and reselecting.
    pub fn is_rate_limit_or_auth(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Auth { .. })
    }

    /// Recovered once per turn by compacting the session.
    pub fn is_context_overflow(&self) -> bool {
        matches!(self, Self::ContextOverflow { .. })
    }
}

// ---------------------------------------------------------------------------
// BackendRegistry
// ---------------------------------------------------------------------------

/// Provider name → backend implementation.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn InferenceBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` under its provider name, replacing any previous one.
    pub fn register(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        let provider = backend.provider().to_string();
        if self.backends.insert(provider.clone(), backend).is_some() {
            tracing::warn!(provider = %provider, "backend provider replaced");
        }
        self
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn InferenceBackend>> {
        self.backends.get(provider).cloned()
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
