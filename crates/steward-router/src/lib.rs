//! # steward-router
//!
//! Decides which inference backend handles a turn.
//!
//! ```text
//! history ──► TaskClassifier ──► TaskCategory
//!                                   │
//!            BackendCatalog ──► ModelRouter ◄── CooldownTracker
//!                                   │
//!                                   ▼
//!                         backend id  |  None
//! ```
//!
//! [`FuzzyMatcher`] and [`parse_model_request`] handle explicit
//! "switch to X" requests from users.

pub mod catalog;
pub mod classifier;
pub mod cooldown;
pub mod error;
pub mod fuzzy;
pub mod router;

pub use catalog::{
    BackendCatalog, BackendConfig, BackendEntry, Capabilities, CatalogBuilder, DEFAULT_ROUTE_KEY,
    Route, split_id,
};
pub use classifier::{ClassifierConfig, KeywordClassifier, TaskCategory, TaskClassifier};
pub use cooldown::{CooldownPolicy, CooldownState, CooldownTracker};
pub use error::{Result, RouterError};
pub use fuzzy::{FuzzyMatcher, MAX_EDIT_DISTANCE, levenshtein, parse_model_request};
pub use router::{ModelRouter, Usability};
