//! Error types for the steward-store crate.
//!
//! Every storage operation returns [`StoreError`] through [`StoreResult`].

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the session and fact stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite rejected a statement or the connection failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A structured column (tool calls, results, attachments) could not be
    /// encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed and was rolled back.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// The requested record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A stored value could not be mapped back to its typed form.
    #[error("corrupt {field} value: {value}")]
    Corrupt { field: &'static str, value: String },

    /// The blocking task running the query was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl StoreError {
    /// Convenience constructor for a missing session.
    pub(crate) fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "session",
            id: id.into(),
        }
    }
}
