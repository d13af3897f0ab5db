//! Database module for bilidown.
//!
//! This module provides the persistence layer using SQLite with sqlx.
//! It includes connection pool management, the serialized write path,
//! models and repositories.

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{Error, Result};
use retry::retry_on_sqlite_busy;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Serialized write pool type alias (max_connections=1).
pub type WritePool = Pool<Sqlite>;

/// Upper bound for the read pool.
const MAX_READ_CONNECTIONS: u32 = 8;

/// Busy timeout applied to every connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Applied on every new connection: checkpoint every 1000 pages, cap the
/// WAL at 16 MiB, ~16 MiB page cache, temp tables in memory.
const CONNECTION_PRAGMAS: [&str; 4] = [
    "PRAGMA wal_autocheckpoint = 1000",
    "PRAGMA journal_size_limit = 16777216",
    "PRAGMA cache_size = -16000",
    "PRAGMA temp_store = MEMORY",
];

fn tune_options(options: SqliteConnectOptions) -> SqliteConnectOptions {
    options
        // WAL lets the read pool run concurrently with the single writer.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true)
        .create_if_missing(true)
}

async fn connect_pool(
    options: SqliteConnectOptions,
    max_connections: u32,
    acquire_timeout: Duration,
    pool_name: &'static str,
) -> std::result::Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                for pragma in CONNECTION_PRAGMAS {
                    sqlx::query(pragma).execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    // The journal mode is persistent per file, so one check per pool suffices.
    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(pool = pool_name, mode = %mode, "Journal mode is not WAL; switching");
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    }

    tracing::debug!(pool = pool_name, max_connections, "Database pool ready");
    Ok(pool)
}

async fn init_read_pool(
    options: SqliteConnectOptions,
    max_connections: u32,
) -> std::result::Result<DbPool, sqlx::Error> {
    connect_pool(options, max_connections, Duration::from_secs(30), "read").await
}

/// Single-connection pool: only one connection ever asks SQLite for the
/// write lock.
async fn init_write_pool(
    options: SqliteConnectOptions,
) -> std::result::Result<WritePool, sqlx::Error> {
    let pool = connect_pool(options, 1, Duration::from_secs(60), "write").await?;

    // Fold frames left behind by a crashed run back into the main file.
    let (busy, log, checkpointed): (i32, i32, i32) =
        sqlx::query_as("PRAGMA wal_checkpoint(PASSIVE)")
            .fetch_one(&pool)
            .await?;
    tracing::info!(busy, log, checkpointed, "Startup WAL checkpoint");

    Ok(pool)
}

async fn begin_immediate(pool: &WritePool) -> std::result::Result<ImmediateTransaction, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction::new(conn))
}

/// Handle to the embedded job database.
///
/// Owns both pools and the process-wide write gate. Every mutation goes
/// through [`Store::begin_write`]; reads use [`Store::reader`] and never
/// take the gate.
///
/// The store must be backed by a file: the read and write pools open
/// separate connections, which would see different `:memory:` databases.
#[derive(Clone)]
pub struct Store {
    read_pool: DbPool,
    write_pool: WritePool,
    write_gate: Arc<Mutex<()>>,
}

impl Store {
    /// Open (creating if missing) the database at a sqlx URL such as
    /// `sqlite:bilidown.db?mode=rwc`.
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = tune_options(SqliteConnectOptions::from_str(database_url)?);
        Self::open_with(options).await
    }

    /// Open (creating if missing) the database file at `path`.
    pub async fn open_file(path: &Path) -> Result<Self> {
        let options = tune_options(SqliteConnectOptions::new().filename(path));
        Self::open_with(options).await
    }

    async fn open_with(options: SqliteConnectOptions) -> Result<Self> {
        let write_pool = init_write_pool(options.clone()).await?;
        let read_pool = init_read_pool(options, default_read_pool_size()).await?;
        Ok(Self {
            read_pool,
            write_pool,
            write_gate: Arc::new(Mutex::new(())),
        })
    }

    /// Create the schema if absent. Safe to run on every startup.
    pub async fn init_schema(&self) -> Result<()> {
        let _gate = self.write_gate.clone().lock_owned().await;
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.write_pool).await?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Pool for read-only queries.
    pub fn reader(&self) -> &DbPool {
        &self.read_pool
    }

    /// Acquire the write gate and open a `BEGIN IMMEDIATE` transaction.
    ///
    /// The gate is held until the returned transaction is committed, rolled
    /// back or dropped.
    pub async fn begin_write(&self) -> Result<WriteTransaction> {
        let permit = self.write_gate.clone().lock_owned().await;
        let pool = &self.write_pool;
        let tx = retry_on_sqlite_busy("begin_immediate", move || async move {
            begin_immediate(pool).await.map_err(Error::from)
        })
        .await?;
        Ok(WriteTransaction {
            tx,
            _permit: permit,
        })
    }

    /// Close both pools.
    pub async fn close(&self) {
        self.write_pool.close().await;
        self.read_pool.close().await;
    }
}

/// Two readers per core, at most [`MAX_READ_CONNECTIONS`].
pub fn default_read_pool_size() -> u32 {
    std::thread::available_parallelism()
        .map_or(2, |n| n.get() as u32)
        .saturating_mul(2)
        .min(MAX_READ_CONNECTIONS)
}

/// A write transaction holding the store's write gate.
///
/// Field order matters: the connection is released before the gate.
pub struct WriteTransaction {
    tx: ImmediateTransaction,
    _permit: OwnedMutexGuard<()>,
}

impl WriteTransaction {
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

impl std::ops::Deref for WriteTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}

impl std::ops::DerefMut for WriteTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tx
    }
}

/// Wrapper for a manual immediate transaction.
///
/// `BEGIN IMMEDIATE` takes the SQLite write lock up front instead of
/// upgrading a deferred read transaction later.
pub struct ImmediateTransaction {
    conn: sqlx::pool::PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    fn new(conn: sqlx::pool::PoolConnection<Sqlite>) -> Self {
        Self {
            conn,
            finished: false,
        }
    }

    pub async fn commit(mut self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        // An unfinished transaction is discarded with its connection so the
        // next writer never inherits an open BEGIN.
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}
