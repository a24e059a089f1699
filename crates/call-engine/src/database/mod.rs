//! # Database Management Module (sqlx + SQLite)
//!
//! Every piece of engine state lives here; in-process structures are caches at
//! most. Each table family gets its own `impl DatabaseManager` block in a
//! submodule:
//!
//! - [`subjects`]: eligibility source tables (subjects, claims, requirements)
//! - [`queue_state`]: per-subject category, score and cooldown, plus the atomic
//!   queue transition
//! - [`queue_entries`]: outbound work items
//! - [`holding_queue`]: inbound callers waiting on an open connection
//! - [`agents`]: agent availability projection
//! - [`callbacks`]: scheduled callbacks
//! - [`missed_contacts`]: audit trail for calls that never reached an agent
//! - [`reconciliation_runs`]: reconciler run history
//!
//! ## Concurrency
//!
//! Transitions that matter for correctness are single conditional `UPDATE`s
//! (`... WHERE status = ?`) checked through `rows_affected()`, or a transaction
//! spanning the read-check-write. Never touch the pool while holding an open
//! transaction from the same task: an in-memory database has exactly one
//! connection.
//!
//! Write transactions go through [`DatabaseManager::begin_write`], which opens
//! them with `BEGIN IMMEDIATE`. A deferred transaction that reads first cannot
//! upgrade to a write lock while another connection holds one, and SQLite
//! reports that as `SQLITE_BUSY` without waiting on the busy timeout.

pub mod agents;
pub mod callbacks;
pub mod holding_queue;
pub mod missed_contacts;
pub mod queue_entries;
pub mod queue_state;
pub mod reconciliation_runs;
pub mod subjects;

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::error::{CallCenterError, Result};

pub use agents::{AgentStatus, DbAgent};
pub use callbacks::{CallbackStatus, DbCallback, NewCallback};
pub use holding_queue::{DbHoldingEntry, HoldingStatus, NewHoldingEntry};
pub use missed_contacts::DbMissedContact;
pub use queue_entries::{DbQueueEntry, EntryStatus, NewQueueEntry};
pub use queue_state::{ApplyOutcome, StateChange};
pub use reconciliation_runs::DbReconciliationRun;
pub use subjects::SqlEligibilitySource;

/// Main database manager using sqlx for async operations
#[derive(Clone, Debug)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// Connect with default pool settings and run migrations
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_config(&DatabaseConfig {
            url: database_url.to_string(),
            ..Default::default()
        })
        .await
    }

    /// Connect using a database configuration section and run migrations
    pub async fn with_config(config: &DatabaseConfig) -> Result<Self> {
        info!("🗄️ Initializing database: {}", config.url);

        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        // Each connection to `sqlite::memory:` is its own database, so the pool must
        // keep exactly one connection alive for the lifetime of the manager.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| CallCenterError::database(format!("Failed to connect to database: {}", e)))?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("✅ Database initialized (in_memory: {})", in_memory);
        Ok(Self { pool })
    }

    /// Create an in-memory database for testing
    pub async fn new_in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a transaction that holds the write lock from its first statement.
    ///
    /// Contention waits on the busy timeout inside `BEGIN IMMEDIATE` instead of
    /// failing at the first write.
    pub async fn begin_write(&self) -> Result<WriteTransaction> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(WriteTransaction { conn: Some(conn) })
    }

    /// Cheap connectivity probe
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Write transaction started by [`DatabaseManager::begin_write`].
///
/// Derefs to the underlying connection, so statements run with `&mut *tx`.
/// Dropping it without `commit` rolls back on a spawned task before the
/// connection goes back to the pool.
pub struct WriteTransaction {
    conn: Option<PoolConnection<Sqlite>>,
}

impl WriteTransaction {
    pub async fn commit(mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    warn!("⚠️ Rollback after failed commit also failed: {}", rollback);
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("ROLLBACK").execute(&mut *conn).await?;
        }
        Ok(())
    }
}

impl Deref for WriteTransaction {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        match &self.conn {
            Some(conn) => &**conn,
            None => unreachable!("write transaction used after it finished"),
        }
    }
}

impl DerefMut for WriteTransaction {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        match &mut self.conn {
            Some(conn) => &mut **conn,
            None => unreachable!("write transaction used after it finished"),
        }
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                        warn!("⚠️ Rollback of abandoned write transaction failed: {}", e);
                    }
                });
            }
            Err(_) => {
                // Closing the connection discards the open transaction.
                drop(conn.detach());
            }
        }
    }
}

/// Retry an idempotent read on transient failures with exponential backoff.
///
/// Writes must not go through here: a write without a status guard could apply
/// twice.
pub async fn retry_read<T, F, Fut>(attempts: u32, base_delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut delay = base_delay;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!("Transient read failure (attempt {}/{}): {}", attempt, attempts, e);
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => {
                debug!("Read failed after {} attempt(s): {}", attempt, e);
                return Err(e);
            }
        }
    }
}

/// Decode a string column into a closed enum, rejecting unknown values
pub(crate) fn decode_enum<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr<Err = CallCenterError>,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(|e| CallCenterError::inconsistency(format!("column '{}': {}", column, e)))
}

pub(crate) fn decode_optional_enum<T>(row: &SqliteRow, column: &str) -> Result<Option<T>>
where
    T: FromStr<Err = CallCenterError>,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| {
        value
            .parse::<T>()
            .map_err(|e| CallCenterError::inconsistency(format!("column '{}': {}", column, e)))
    })
    .transpose()
}
