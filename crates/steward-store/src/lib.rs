//! # steward-store
//!
//! SQLite persistence for Steward conversations.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  SessionStore  (sequenced message log)  │
//! │  FactStore     (extracted memories)     │
//! ├─────────────────────────────────────────┤
//! │  sanitize_messages (tool-pair repair)   │
//! ├─────────────────────────────────────────┤
//! │  Database (rusqlite WAL, blocking pool) │
//! │  Migrations (versioned, transactional)  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use steward_store::{Database, Message, SessionScope, SessionStore};
//!
//! let db = Database::open_and_migrate("data/steward.db").await?;
//! let sessions = SessionStore::new(db);
//! let session = sessions.get_or_create("support", SessionScope::User, "u-42").await?;
//! sessions.append_message(&session.id, Message::user("hello")).await?;
//! let history = sessions.get_messages(&session.id, Some(50)).await?;
//! ```

pub mod db;
pub mod error;
pub mod memory;
pub mod message;
pub mod migration;
pub mod sanitize;
pub mod session;

// ── re-exports ───────────────────────────────────────────────────────

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use memory::{Fact, FactCategory, FactStore, NewFact};
pub use message::{Attachment, AttachmentKind, Message, Role, ToolCall, ToolResult};
pub use sanitize::sanitize_messages;
pub use session::{
    CompactionOutcome, DEFAULT_KEEP_RECENT, Session, SessionMessage, SessionScope, SessionStore,
};
