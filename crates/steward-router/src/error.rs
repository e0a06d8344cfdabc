//! Router error types.
//!
//! Selection itself never fails: "no backend available" is `None`, not an
//! error. [`RouterError`] covers building a catalog or classifier from
//! configuration.

/// Errors raised while assembling routing state.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Two backends share an id.
    #[error("duplicate backend id: {id}")]
    DuplicateBackend { id: String },

    /// A backend id is not of the form `provider/model`.
    #[error("invalid backend id `{id}`: {reason}")]
    InvalidBackendId { id: String, reason: String },

    /// A route key names no known task category.
    #[error("unknown task category `{name}` in routes")]
    UnknownCategory { name: String },
}

/// Convenience alias used throughout the router crate.
pub type Result<T> = std::result::Result<T, RouterError>;
