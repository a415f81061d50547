//! Record Store - SQLite-backed keyed persistence for record collections
//!
//! Every allowed collection gets its own table holding the record identifier
//! and the encoded record payload. Writes go through [`Transaction`] so a
//! whole batch lands or nothing does.
//!
//! The database is stored in XDG_DATA_HOME/recordsync/records.db

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Errors raised by a persistence backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("transaction is no longer active")]
    Inactive,

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("statement exceeded its deadline and was interrupted")]
    DeadlineExceeded,

    #[error("{0}")]
    Backend(String),
}

/// VM instructions between deadline checks
const PROGRESS_OPS: i32 = 1000;

/// Source of transactions over keyed collections
#[async_trait]
pub trait Backend: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;
}

/// One open transaction
///
/// Dropping an active transaction rolls it back.
#[async_trait]
pub trait Transaction: Send {
    /// Insert the payload under `id`, replacing any stored payload
    async fn upsert(&mut self, collection: &str, id: i64, payload: &[u8])
        -> Result<(), StoreError>;

    /// Bound the following statements by `deadline`
    ///
    /// Backends that block while executing should interrupt themselves once
    /// the deadline passes and fail with [`StoreError::DeadlineExceeded`].
    fn set_deadline(&mut self, _deadline: Option<StdInstant>) {}

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}

/// SQLite record store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the store at a specific path
    pub fn open_at(path: &Path, collections: &[String]) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn, collections)?;

        info!("Record store opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory(collections: &[String]) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, collections)
    }

    fn from_connection(conn: Connection, collections: &[String]) -> Result<Self, StoreError> {
        Self::initialize(&conn, collections)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Get the default database path
    pub fn default_path() -> PathBuf {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        data_dir.join("recordsync").join("records.db")
    }

    /// Create one table per collection
    ///
    /// Names must already be validated identifiers; they are spliced into SQL.
    fn initialize(conn: &Connection, collections: &[String]) -> Result<(), StoreError> {
        for collection in collections {
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {collection} (
                    id INTEGER PRIMARY KEY,
                    data TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                "#
            ))?;
        }

        debug!("Record store schema initialized for {:?}", collections);
        Ok(())
    }

    /// Number of stored records in a collection
    pub async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {collection}"),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Stored payload for a single identifier
    pub async fn get(&self, collection: &str, id: i64) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().await;
        let data = conn
            .query_row(
                &format!("SELECT data FROM {collection} WHERE id = ?1"),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    /// Run raw SQL against the store outside any transaction
    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.conn.lock().await.execute_batch(sql)?;
        Ok(())
    }
}

#[async_trait]
impl Backend for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let conn = self.conn.clone().lock_owned().await;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTransaction {
            conn,
            active: true,
            deadline: None,
        }))
    }
}

/// Transaction holding the store's connection until it finishes
pub struct SqliteTransaction {
    conn: OwnedMutexGuard<Connection>,
    active: bool,
    deadline: Option<StdInstant>,
}

impl SqliteTransaction {
    /// Run `op` with the VM interrupted once the deadline passes
    fn bounded<T>(
        &mut self,
        op: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let Some(deadline) = self.deadline else {
            return op(&self.conn).map_err(StoreError::from);
        };
        if StdInstant::now() >= deadline {
            return Err(StoreError::DeadlineExceeded);
        }

        let expired = Arc::new(AtomicBool::new(false));
        let flag = expired.clone();
        self.conn.progress_handler(
            PROGRESS_OPS,
            Some(move || {
                let past = StdInstant::now() >= deadline;
                if past {
                    flag.store(true, Ordering::SeqCst);
                }
                past
            }),
        );

        let result = op(&self.conn);
        self.conn.progress_handler(0, None::<fn() -> bool>);

        match result {
            Err(_) if expired.load(Ordering::SeqCst) => Err(StoreError::DeadlineExceeded),
            other => other.map_err(StoreError::from),
        }
    }

    /// Fail unless the transaction is still open
    ///
    /// An interrupted write makes SQLite roll the whole transaction back on
    /// its own, which leaves the connection in autocommit mode.
    fn ensure_active(&self) -> Result<(), StoreError> {
        if !self.active || self.conn.is_autocommit() {
            return Err(StoreError::Inactive);
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn upsert(
        &mut self,
        collection: &str,
        id: i64,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        self.ensure_active()?;

        let data = std::str::from_utf8(payload)
            .map_err(|e| StoreError::Backend(format!("payload is not UTF-8: {e}")))?;
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            r#"
            INSERT INTO {collection} (id, data, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at
            "#
        );

        self.bounded(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            stmt.execute(params![id, data, now])
        })?;
        Ok(())
    }

    fn set_deadline(&mut self, deadline: Option<StdInstant>) {
        self.deadline = deadline;
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_active()?;
        let result = self.bounded(|conn| conn.execute_batch("COMMIT"));
        // SQLite ends the transaction on a failed COMMIT only in some cases
        self.active = !self.conn.is_autocommit();
        result
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if !self.active {
            return Err(StoreError::Inactive);
        }
        if self.conn.is_autocommit() {
            debug!("Transaction already rolled back");
            self.active = false;
            return Ok(());
        }
        let result = self.conn.execute_batch("ROLLBACK");
        self.active = !self.conn.is_autocommit();
        result.map_err(StoreError::from)
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.active && !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("Failed to roll back abandoned transaction: {}", e);
            }
        }
    }
}
