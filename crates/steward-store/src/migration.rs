//! Versioned schema migrations.
//!
//! Each migration is a static SQL batch with a version number. Applied
//! versions are recorded in `_migrations`, so running the set twice is a
//! no-op. New migrations go at the end of [`MIGRATIONS`].

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "sessions and sequenced session messages",
        sql: r#"
            CREATE TABLE sessions (
                id                TEXT PRIMARY KEY,
                key               TEXT NOT NULL,
                scope             TEXT NOT NULL CHECK(scope IN ('global','user','channel','thread')),
                scope_id          TEXT NOT NULL DEFAULT '',
                summary           TEXT,
                message_count     INTEGER NOT NULL DEFAULT 0,
                last_compacted_at INTEGER,
                created_at        INTEGER NOT NULL,
                updated_at        INTEGER NOT NULL,
                UNIQUE(key, scope, scope_id)
            );
            CREATE INDEX idx_sessions_updated ON sessions(updated_at);

            CREATE TABLE session_messages (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id   TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                seq          INTEGER NOT NULL,
                role         TEXT NOT NULL CHECK(role IN ('system','user','assistant','tool')),
                content      TEXT NOT NULL DEFAULT '',
                tool_calls   TEXT,
                tool_results TEXT,
                attachments  TEXT,
                compacted    INTEGER NOT NULL DEFAULT 0,
                created_at   INTEGER NOT NULL,
                UNIQUE(session_id, seq)
            );
            CREATE INDEX idx_session_messages_live ON session_messages(session_id, compacted, seq);
        "#,
    },
    Migration {
        version: 2,
        description: "durable memory facts extracted from conversations",
        sql: r#"
            CREATE TABLE memory_facts (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id  TEXT,
                category    TEXT NOT NULL CHECK(category IN ('preference','knowledge','pattern','skill','task')),
                content     TEXT NOT NULL,
                importance  REAL NOT NULL DEFAULT 0.5,
                created_at  INTEGER NOT NULL
            );
            CREATE INDEX idx_memory_facts_category ON memory_facts(category);
            CREATE INDEX idx_memory_facts_created ON memory_facts(created_at);
        "#,
    },
];

/// Apply every migration newer than the recorded schema version.
///
/// Synchronous; [`crate::Database::run_migrations`] calls it on the
/// blocking pool.
pub fn run_all(conn: &mut Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("cannot create _migrations: {e}"),
    })?;

    let current = current_version(conn)?;
    let mut applied = 0usize;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply(conn, migration)?;
        applied += 1;
    }

    if applied == 0 {
        debug!(version = current, "schema up to date");
    } else {
        info!(from = current, applied, "schema migrated");
    }
    Ok(())
}

/// Highest applied migration version, 0 on a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
        row.get(0)
    })
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("cannot read schema version: {e}"),
    })
}

fn apply(conn: &mut Connection, migration: &Migration) -> StoreResult<()> {
    let fail = |message: String| StoreError::Migration {
        version: migration.version,
        message,
    };

    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    // Dropping the transaction without commit rolls it back.
    let tx = conn.transaction().map_err(|e| fail(e.to_string()))?;
    tx.execute_batch(migration.sql)
        .map_err(|e| fail(format!("sql failed: {e}")))?;
    tx.execute(
        "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            migration.version,
            migration.description,
            chrono::Utc::now().timestamp()
        ],
    )
    .map_err(|e| fail(format!("cannot record migration: {e}")))?;
    tx.commit().map_err(|e| fail(format!("commit failed: {e}")))
}
