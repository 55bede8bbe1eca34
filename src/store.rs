// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backing store for pending distribution rows.
//!
//! The engine only needs two capabilities from wherever tasks are recorded,
//! captured by [`TaskStore`]:
//!
//! - `fetch_pending_tasks` - rows due for distribution, ascending id
//! - `update_status` - write a final status back
//!
//! Two implementations ship with the crate: [`NoOpTaskStore`] for runs
//! driven purely from the control plane, and [`SqliteTaskStore`].
//!
//! # SQLite Schema
//!
//! ```text
//! sync_files(id, uri, md5, dest, status, at)
//! ```
//!
//! A row is pending when `at <= now` and its status is neither `200`
//! (complete) nor `404` (unusable). A `500` row is therefore picked up again
//! on the next poll.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff (5
//! attempts, 10ms doubling to 500ms). Anything else surfaces immediately.

use crate::config::StoreConfig;
use crate::error::{DistributionError, Result};
use crate::task::TaskStatus;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Type alias for boxed async futures (keeps the trait object-safe).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const MEMORY_PATH: &str = ":memory:";

/// One candidate row as stored. Any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingRow {
    pub id: i64,
    /// File name relative to the distribution root.
    pub source_uri: Option<String>,
    /// Checksum recorded by whoever queued the row.
    pub checksum_hint: Option<String>,
    /// Comma-separated host filter.
    pub destination_host_filter: Option<String>,
}

/// What the engine needs from the backing store.
pub trait TaskStore: Send + Sync + 'static {
    /// Rows due for distribution, in ascending id order.
    fn fetch_pending_tasks(&self) -> BoxFuture<'_, Vec<PendingRow>>;

    /// Persist a status. Returns the number of affected rows.
    fn update_status(&self, id: i64, status: TaskStatus) -> BoxFuture<'_, u64>;
}

/// Store with nothing pending that accepts and discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTaskStore;

impl TaskStore for NoOpTaskStore {
    fn fetch_pending_tasks(&self) -> BoxFuture<'_, Vec<PendingRow>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn update_status(&self, _id: i64, _status: TaskStatus) -> BoxFuture<'_, u64> {
        Box::pin(async { Ok(0) })
    }
}

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// SQLite-backed [`TaskStore`].
pub struct SqliteTaskStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteTaskStore {
    /// Open (creating if needed) the database and its table.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, "Opening task store");

        let pool = if path == MEMORY_PATH {
            // Every connection to :memory: is a separate database
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DistributionError::Config(format!("Invalid SQLite path: {}", e)))?;
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let journal = if config.wal_mode {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            };
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
                .map_err(|e| DistributionError::Config(format!("Invalid SQLite path: {}", e)))?
                .journal_mode(journal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await?
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uri TEXT,
                md5 TEXT,
                dest TEXT,
                status INTEGER NOT NULL DEFAULT 0,
                at INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Queue a row, due immediately. Returns its id.
    pub async fn insert_pending(&self, uri: &str, checksum: Option<&str>, dest: &str) -> Result<i64> {
        let now = unix_now();
        let result = execute_with_retry("insert_pending", || {
            sqlx::query("INSERT INTO sync_files (uri, md5, dest, status, at) VALUES (?, ?, ?, 0, ?)")
                .bind(uri)
                .bind(checksum)
                .bind(dest)
                .bind(now)
                .execute(&self.pool)
        })
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Current status code of a row.
    pub async fn status_of(&self, id: i64) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT status FROM sync_files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(status,)| status))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl TaskStore for SqliteTaskStore {
    fn fetch_pending_tasks(&self) -> BoxFuture<'_, Vec<PendingRow>> {
        Box::pin(async move {
            let now = unix_now();
            let rows = execute_with_retry("fetch_pending", || {
                sqlx::query_as::<_, (i64, Option<String>, Option<String>, Option<String>)>(
                    "SELECT id, uri, md5, dest FROM sync_files \
                     WHERE at <= ? AND status NOT IN (200, 404) ORDER BY id ASC",
                )
                .bind(now)
                .fetch_all(&self.pool)
            })
            .await?;

            debug!(count = rows.len(), "Fetched pending rows");
            Ok(rows
                .into_iter()
                .map(|(id, source_uri, checksum_hint, destination_host_filter)| PendingRow {
                    id,
                    source_uri,
                    checksum_hint,
                    destination_host_filter,
                })
                .collect())
        })
    }

    fn update_status(&self, id: i64, status: TaskStatus) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            let code = i64::from(status.code());
            let result = execute_with_retry("update_status", || {
                sqlx::query("UPDATE sync_files SET status = ? WHERE id = ?")
                    .bind(code)
                    .bind(id)
                    .execute(&self.pool)
            })
            .await?;
            Ok(result.rows_affected())
        })
    }
}
