//! SQLite handle shared by the session and fact stores.
//!
//! A single `rusqlite::Connection` sits behind `Arc<Mutex<..>>`; every query
//! is shipped to tokio's blocking pool so async callers never stall the
//! runtime. Writes from different sessions serialize on the mutex, which is
//! what gives the store its per-call atomicity.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Cloneable, thread-safe database handle.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file at `path`.
    ///
    /// Blocks on file I/O; call during startup or from `spawn_blocking`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening session database");

        let conn = Connection::open(path)?;
        configure(&conn)?;
        Ok(Self::wrap(conn))
    }

    /// Open a private in-memory database. Used by tests and dry runs.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory session database");
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        Ok(Self::wrap(conn))
    }

    /// Open `path` on the blocking pool and bring its schema up to date.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// In-memory database with every migration applied.
    pub async fn in_memory_migrated() -> StoreResult<Self> {
        let db = Self::open_in_memory()?;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Apply pending schema migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute_mut(migration::run_all).await
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.execute_mut(move |conn| f(conn)).await
    }

    /// Run `f` with mutable access, e.g. to open a transaction.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("connection mutex poisoned: {e}")))?;
            f(&mut guard)
        })
        .await?
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

/// Connection pragmas. WAL keeps readers unblocked while a Runner appends.
fn configure(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    // Required for ON DELETE CASCADE from sessions to session_messages.
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
    debug!("sqlite pragmas applied");
    Ok(())
}
