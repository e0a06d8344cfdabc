//! Session persistence for conversation history.
//!
//! A session is identified by `(key, scope, scope_id)` so one logical
//! conversation key can fan out into independent histories per user,
//! channel or thread. Messages are an append-only log ordered by a
//! per-session sequence number assigned inside the insert transaction;
//! wall-clock timestamps are informational only. Compaction never deletes
//! rows, it flags them so the audit trail survives.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::message::{Message, Role};
use crate::sanitize::sanitize_messages;

/// Live messages kept verbatim by [`SessionStore::compact`].
pub const DEFAULT_KEEP_RECENT: usize = 10;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Partition a session key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionScope {
    /// One history shared by everyone using the key.
    Global,
    /// One history per user id.
    User,
    /// One history per channel id.
    Channel,
    /// One history per thread id.
    Thread,
}

impl SessionScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::User => "user",
            Self::Channel => "channel",
            Self::Thread => "thread",
        }
    }
}

impl fmt::Display for SessionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionScope {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "user" => Ok(Self::User),
            "channel" => Ok(Self::Channel),
            "thread" => Ok(Self::Thread),
            other => Err(StoreError::Corrupt {
                field: "scope",
                value: other.to_string(),
            }),
        }
    }
}

/// A conversation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// UUID v7.
    pub id: String,
    pub key: String,
    pub scope: SessionScope,
    /// Empty for [`SessionScope::Global`].
    pub scope_id: String,
    /// Summary written by the latest compaction, `None` before the first.
    pub summary: Option<String>,
    /// Messages ever appended, compacted ones included.
    pub message_count: i64,
    /// Unix milliseconds of the latest compaction or reset.
    pub last_compacted_at: Option<i64>,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub updated_at: i64,
}

/// A persisted message with its position in the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    /// Row id.
    pub id: i64,
    pub session_id: String,
    /// Authoritative conversation order, starting at 1.
    pub seq: i64,
    #[serde(flatten)]
    pub message: Message,
    pub compacted: bool,
    /// Unix milliseconds. Informational; may collide.
    pub created_at: i64,
}

impl AsRef<Message> for SessionMessage {
    fn as_ref(&self) -> &Message {
        &self.message
    }
}

impl AsMut<Message> for SessionMessage {
    fn as_mut(&mut self) -> &mut Message {
        &mut self.message
    }
}

impl From<SessionMessage> for Message {
    fn from(row: SessionMessage) -> Self {
        row.message
    }
}

/// What a compaction did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionOutcome {
    /// Messages flagged compacted by this call. Zero means no-op.
    pub compacted: usize,
    /// Live messages remaining.
    pub kept: usize,
}

impl CompactionOutcome {
    pub fn is_noop(&self) -> bool {
        self.compacted == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SessionStore
// ═══════════════════════════════════════════════════════════════════════

const SESSION_COLUMNS: &str = "id, key, scope, scope_id, summary, message_count, \
                               last_compacted_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, session_id, seq, role, content, tool_calls, \
                               tool_results, attachments, compacted, created_at";

/// Session and message operations over a [`Database`].
///
/// Safe to share across tasks. Appends to one session must come from one
/// writer at a time for the log to match call order.
#[derive(Clone)]
pub struct SessionStore {
    db: Database,
    keep_recent: usize,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            keep_recent: DEFAULT_KEEP_RECENT,
        }
    }

    /// Override how many live messages [`Self::compact`] keeps.
    pub fn with_keep_recent(mut self, keep_recent: usize) -> Self {
        self.keep_recent = keep_recent;
        self
    }

    pub fn keep_recent(&self) -> usize {
        self.keep_recent
    }

    /// Fetch the session for `(key, scope, scope_id)`, creating it on first use.
    #[instrument(skip(self))]
    pub async fn get_or_create(
        &self,
        key: &str,
        scope: SessionScope,
        scope_id: &str,
    ) -> StoreResult<Session> {
        let key = key.to_string();
        let scope_id = scope_id.to_string();
        let id = Uuid::now_v7().to_string();
        let now = now_millis();

        self.db
            .execute(move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO sessions (id, key, scope, scope_id, message_count, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5) \
                     ON CONFLICT(key, scope, scope_id) DO NOTHING",
                    rusqlite::params![id, key, scope.as_str(), scope_id, now],
                )?;
                if inserted == 1 {
                    info!(session_id = %id, key = %key, scope = %scope, "session created");
                }
                find_session(conn, &key, scope, &scope_id)?
                    .ok_or_else(|| StoreError::session_not_found(format!("{key}/{scope}/{scope_id}")))
            })
            .await
    }

    /// Look up a session by its identifying triple without creating it.
    #[instrument(skip(self))]
    pub async fn find(
        &self,
        key: &str,
        scope: SessionScope,
        scope_id: &str,
    ) -> StoreResult<Option<Session>> {
        let key = key.to_string();
        let scope_id = scope_id.to_string();
        self.db
            .execute(move |conn| find_session(conn, &key, scope, &scope_id))
            .await
    }

    /// Fetch a session by id.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<Session> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                    [&id],
                    read_session,
                )
                .optional()?
                .ok_or_else(|| StoreError::session_not_found(id))
            })
            .await
    }

    /// Sessions ordered by most recent activity.
    #[instrument(skip(self))]
    pub async fn list(&self, limit: u32, offset: u32) -> StoreResult<Vec<Session>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions \
                     ORDER BY updated_at DESC, id DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![limit, offset], read_session)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Every session sharing `key`, across scopes.
    #[instrument(skip(self))]
    pub async fn list_by_key(&self, key: &str) -> StoreResult<Vec<Session>> {
        let key = key.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE key = ?1 \
                     ORDER BY scope, scope_id"
                ))?;
                let rows = stmt
                    .query_map([&key], read_session)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Delete a session; its messages go with it.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", [&id])?;
                if deleted == 0 {
                    return Err(StoreError::session_not_found(id));
                }
                info!(session_id = %id, "session deleted");
                Ok(())
            })
            .await
    }

    /// Append a message with the next sequence number.
    ///
    /// The insert, the counter bump and the `updated_at` refresh commit
    /// together.
    #[instrument(skip(self, message), fields(role = %message.role))]
    pub async fn append_message(
        &self,
        session_id: &str,
        message: Message,
    ) -> StoreResult<SessionMessage> {
        let session_id = session_id.to_string();
        let now = now_millis();
        let tool_calls = encode_list(&message.tool_calls)?;
        let tool_results = encode_list(&message.tool_results)?;
        let attachments = encode_list(&message.attachments)?;

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;

                let touched = tx.execute(
                    "UPDATE sessions SET message_count = message_count + 1, updated_at = ?2 \
                     WHERE id = ?1",
                    rusqlite::params![session_id, now],
                )?;
                if touched == 0 {
                    return Err(StoreError::session_not_found(session_id));
                }

                let seq: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM session_messages WHERE session_id = ?1",
                    [&session_id],
                    |row| row.get(0),
                )?;

                tx.execute(
                    "INSERT INTO session_messages \
                     (session_id, seq, role, content, tool_calls, tool_results, attachments, compacted, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
                    rusqlite::params![
                        session_id,
                        seq,
                        message.role.as_str(),
                        message.content,
                        tool_calls,
                        tool_results,
                        attachments,
                        now,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;

                debug!(session_id = %session_id, seq, "message appended");
                Ok(SessionMessage {
                    id,
                    session_id,
                    seq,
                    message,
                    compacted: false,
                    created_at: now,
                })
            })
            .await
    }

    /// The newest `limit` live messages in sequence order, sanitized.
    ///
    /// `None` or `Some(0)` returns every live message. Orphaned tool results
    /// are stripped (see [`sanitize_messages`]).
    #[instrument(skip(self))]
    pub async fn get_messages(
        &self,
        session_id: &str,
        limit: Option<u32>,
    ) -> StoreResult<Vec<SessionMessage>> {
        let session_id = session_id.to_string();
        // SQLite treats a negative LIMIT as unbounded.
        let limit: i64 = match limit {
            Some(n) if n > 0 => i64::from(n),
            _ => -1,
        };

        let rows = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM ( \
                         SELECT * FROM session_messages \
                         WHERE session_id = ?1 AND compacted = 0 \
                         ORDER BY seq DESC LIMIT ?2 \
                     ) ORDER BY seq ASC"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![session_id, limit], read_message)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(sanitize_messages(rows))
    }

    /// The full log including compacted rows, unsanitized. For audits.
    #[instrument(skip(self))]
    pub async fn get_all_messages(&self, session_id: &str) -> StoreResult<Vec<SessionMessage>> {
        let session_id = session_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM session_messages \
                     WHERE session_id = ?1 ORDER BY seq ASC"
                ))?;
                let rows = stmt
                    .query_map([&session_id], read_message)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Number of messages not yet compacted.
    #[instrument(skip(self))]
    pub async fn count_live_messages(&self, session_id: &str) -> StoreResult<i64> {
        let session_id = session_id.to_string();
        self.db
            .execute(move |conn| count_live(conn, &session_id))
            .await
    }

    /// Compact keeping the store's configured number of recent messages.
    pub async fn compact(&self, session_id: &str, summary: &str) -> StoreResult<CompactionOutcome> {
        self.compact_keeping(session_id, summary, self.keep_recent)
            .await
    }

    /// Flag all but the newest `keep` live messages as compacted and record
    /// `summary` on the session.
    ///
    /// No-op (summary untouched) when `keep` or fewer messages are live.
    #[instrument(skip(self, summary))]
    pub async fn compact_keeping(
        &self,
        session_id: &str,
        summary: &str,
        keep: usize,
    ) -> StoreResult<CompactionOutcome> {
        let session_id = session_id.to_string();
        let summary = summary.to_string();
        let now = now_millis();
        let keep_i64 = i64::try_from(keep).unwrap_or(i64::MAX);

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                ensure_session(&tx, &session_id)?;

                let live = count_live(&tx, &session_id)?;
                if live <= keep_i64 {
                    debug!(session_id = %session_id, live, keep, "compaction not needed");
                    return Ok(CompactionOutcome {
                        compacted: 0,
                        kept: usize::try_from(live).unwrap_or(0),
                    });
                }

                // Oldest seq among the rows to keep; with keep = 0 nothing survives.
                let cutoff: Option<i64> = tx.query_row(
                    "SELECT MIN(seq) FROM ( \
                         SELECT seq FROM session_messages \
                         WHERE session_id = ?1 AND compacted = 0 \
                         ORDER BY seq DESC LIMIT ?2 \
                     )",
                    rusqlite::params![session_id, keep_i64],
                    |row| row.get(0),
                )?;
                let cutoff = cutoff.unwrap_or(i64::MAX);

                let compacted = tx.execute(
                    "UPDATE session_messages SET compacted = 1 \
                     WHERE session_id = ?1 AND compacted = 0 AND seq < ?2",
                    rusqlite::params![session_id, cutoff],
                )?;
                tx.execute(
                    "UPDATE sessions SET summary = ?2, last_compacted_at = ?3, updated_at = ?3 \
                     WHERE id = ?1",
                    rusqlite::params![session_id, summary, now],
                )?;
                tx.commit()?;

                info!(session_id = %session_id, compacted, kept = keep, "session compacted");
                Ok(CompactionOutcome {
                    compacted,
                    kept: keep,
                })
            })
            .await
    }

    /// Start the conversation over: every live message is flagged compacted
    /// and the summary is cleared. Returns how many messages were flagged.
    #[instrument(skip(self))]
    pub async fn reset(&self, session_id: &str) -> StoreResult<usize> {
        let session_id = session_id.to_string();
        let now = now_millis();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                ensure_session(&tx, &session_id)?;
                let flagged = tx.execute(
                    "UPDATE session_messages SET compacted = 1 \
                     WHERE session_id = ?1 AND compacted = 0",
                    [&session_id],
                )?;
                tx.execute(
                    "UPDATE sessions SET summary = NULL, last_compacted_at = ?2, updated_at = ?2 \
                     WHERE id = ?1",
                    rusqlite::params![session_id, now],
                )?;
                tx.commit()?;
                info!(session_id = %session_id, flagged, "session reset");
                Ok(flagged)
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Row helpers
// ═══════════════════════════════════════════════════════════════════════

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn find_session(
    conn: &Connection,
    key: &str,
    scope: SessionScope,
    scope_id: &str,
) -> StoreResult<Option<Session>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions \
                 WHERE key = ?1 AND scope = ?2 AND scope_id = ?3"
            ),
            rusqlite::params![key, scope.as_str(), scope_id],
            read_session,
        )
        .optional()?)
}

fn ensure_session(conn: &Connection, session_id: &str) -> StoreResult<()> {
    let exists = conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?1", [session_id], |_| Ok(()))
        .optional()?;
    exists.ok_or_else(|| StoreError::session_not_found(session_id))
}

fn count_live(conn: &Connection, session_id: &str) -> StoreResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM session_messages WHERE session_id = ?1 AND compacted = 0",
        [session_id],
        |row| row.get(0),
    )?)
}

fn read_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let scope: String = row.get(2)?;
    Ok(Session {
        id: row.get(0)?,
        key: row.get(1)?,
        scope: scope.parse().map_err(|e| conversion_error(2, e))?,
        scope_id: row.get(3)?,
        summary: row.get(4)?,
        message_count: row.get(5)?,
        last_compacted_at: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn read_message(row: &Row<'_>) -> rusqlite::Result<SessionMessage> {
    let role: String = row.get(3)?;
    let role: Role = role.parse().map_err(|e| conversion_error(3, e))?;
    Ok(SessionMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        seq: row.get(2)?,
        message: Message {
            role,
            content: row.get(4)?,
            tool_calls: decode_list(row, 5)?,
            tool_results: decode_list(row, 6)?,
            attachments: decode_list(row, 7)?,
        },
        compacted: row.get(8)?,
        created_at: row.get(9)?,
    })
}

/// Empty lists are stored as NULL.
fn encode_list<T: Serialize>(items: &[T]) -> StoreResult<Option<String>> {
    if items.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(items)?))
    }
}

fn decode_list<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<T>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(Vec::new()),
        Some(text) => {
            serde_json::from_str(&text).map_err(|e| conversion_error(idx, StoreError::Json(e)))
        }
    }
}

fn conversion_error(idx: usize, err: StoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

// ── tests ────────────────────────────────────────────────────────────
