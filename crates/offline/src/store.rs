//! Durable local store backed by SQLite.
//!
//! Holds the entity tables (jobs, clients, technicians), unsaved drafts, media blobs,
//! the mutation queue and the cross-instance sync lease in one database file, so a
//! single transaction can span all of them. Every instance of the client on the device
//! opens the same file.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use fieldops_core::{DomainError, MediaKey};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use thiserror::Error;

/// SQLite's primary result code for "database or disk is full".
const SQLITE_FULL: &str = "13";

/// Tables of the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Jobs,
    Clients,
    Technicians,
    Drafts,
    MediaBlobs,
    QueueItems,
    SyncLease,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Jobs => "jobs",
            Table::Clients => "clients",
            Table::Technicians => "technicians",
            Table::Drafts => "drafts",
            Table::MediaBlobs => "media_blobs",
            Table::QueueItems => "queue_items",
            Table::SyncLease => "sync_lease",
        }
    }

    /// Tables holding JSON records keyed by string (`put`/`get`/`delete`).
    pub fn is_record_table(&self) -> bool {
        matches!(
            self,
            Table::Jobs | Table::Clients | Table::Technicians | Table::Drafts
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The device ran out of space, or the media quota is used up.
    #[error("local storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("table '{0}' is not part of this transaction")]
    OutOfScope(&'static str),

    #[error("table '{0}' does not hold records")]
    NotARecordTable(&'static str),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded(_))
    }
}

/// Map a sqlx error, separating "disk full" from every other failure.
pub(crate) fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            match db_err.code() {
                Some(code) if code.as_ref() == SQLITE_FULL => StoreError::QuotaExceeded(message),
                _ => StoreError::Database { operation, message },
            }
        }
        sqlx::Error::PoolTimedOut => StoreError::Database {
            operation,
            message: "timed out waiting for a database connection".to_string(),
        },
        other => StoreError::Database {
            operation,
            message: other.to_string(),
        },
    }
}

/// A stored photo or other binary evidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBlob {
    pub key: MediaKey,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Future returned by the body of [`LocalStore::transaction`].
pub type TxFuture<'t, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 't>>;

/// SQLite-backed local store.
///
/// This struct is cheap to clone and is safe to share across tasks.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    media_quota_bytes: u64,
}

impl LocalStore {
    /// Open (or create) the store at `path`.
    pub async fn open(path: &Path, media_quota_bytes: u64) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory at {:?}", parent))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open local store at {:?}", path))?;

        Self::with_pool(pool, media_quota_bytes).await
    }

    /// Open a private in-memory store (tests).
    ///
    /// Uses a single long-lived connection; an in-memory database lives and dies with it.
    pub async fn open_in_memory(media_quota_bytes: u64) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("invalid in-memory connection string")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("failed to open in-memory local store")?;

        Self::with_pool(pool, media_quota_bytes).await
    }

    async fn with_pool(pool: SqlitePool, media_quota_bytes: u64) -> anyhow::Result<Self> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&pool)
                .await
                .with_context(|| format!("failed to apply schema statement: {statement}"))?;
        }

        Ok(Self {
            pool,
            media_quota_bytes,
        })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn media_quota_bytes(&self) -> u64 {
        self.media_quota_bytes
    }

    /// Start a transaction allowed to write `tables`.
    ///
    /// The write lock is taken up front (`BEGIN IMMEDIATE`): a deferred transaction that
    /// reads first cannot wait for a busy writer when it upgrades, and fails instead.
    /// Dropping the returned [`StoreTx`] without calling `commit` rolls it back.
    pub async fn begin(&self, tables: &[Table]) -> Result<StoreTx, StoreError> {
        let tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        Ok(StoreTx {
            tx,
            scope: tables.to_vec(),
            media_quota_bytes: self.media_quota_bytes,
        })
    }

    /// Run `f` in a transaction: all writes it makes commit together, or none do.
    ///
    /// ```ignore
    /// store
    ///     .transaction(&[Table::Jobs, Table::MediaBlobs], move |tx| {
    ///         Box::pin(async move {
    ///             tx.put_blob(&key, &bytes, "image/jpeg").await?;
    ///             tx.put(Table::Jobs, &job_id, &job).await?;
    ///             Ok::<_, StoreError>(())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn transaction<T, E, F>(&self, tables: &[Table], f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut StoreTx) -> TxFuture<'t, T, E>,
        E: From<StoreError>,
    {
        let mut tx = self.begin(tables).await?;

        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback().await;
                Err(err)
            }
        }
    }

    pub async fn put<T: Serialize + Sync>(
        &self,
        table: Table,
        key: &str,
        record: &T,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin(&[table]).await?;
        tx.put(table, key, record).await?;
        tx.commit().await
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        table: Table,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        if !table.is_record_table() {
            return Err(StoreError::NotARecordTable(table.name()));
        }

        let row = sqlx::query(&format!("SELECT data FROM {} WHERE key = ?1", table.name()))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_record", e))?;

        decode_record(row)
    }

    pub async fn delete(&self, table: Table, key: &str) -> Result<bool, StoreError> {
        let mut tx = self.begin(&[table]).await?;
        let removed = tx.delete(table, key).await?;
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn put_blob(
        &self,
        key: &MediaKey,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin(&[Table::MediaBlobs]).await?;
        tx.put_blob(key, bytes, content_type).await?;
        tx.commit().await
    }

    pub async fn get_blob(&self, key: &MediaKey) -> Result<Option<MediaBlob>, StoreError> {
        let row = sqlx::query("SELECT content_type, bytes FROM media_blobs WHERE key = ?1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_blob", e))?;

        decode_blob(key, row)
    }

    pub async fn delete_blob(&self, key: &MediaKey) -> Result<bool, StoreError> {
        let mut tx = self.begin(&[Table::MediaBlobs]).await?;
        let removed = tx.delete_blob(key).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Bytes currently held in the blob table.
    pub async fn media_usage_bytes(&self) -> Result<u64, StoreError> {
        let used: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(size), 0) FROM media_blobs")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("media_usage", e))?;
        Ok(used.max(0) as u64)
    }
}

/// An open store transaction scoped to a set of tables.
#[derive(Debug)]
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
    scope: Vec<Table>,
    media_quota_bytes: u64,
}

impl StoreTx {
    fn check_scope(&self, table: Table) -> Result<(), StoreError> {
        if self.scope.contains(&table) {
            Ok(())
        } else {
            Err(StoreError::OutOfScope(table.name()))
        }
    }

    /// Connection for reads inside the transaction.
    pub(crate) fn reader(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// Connection for writes to `table`, if the transaction declared it.
    pub(crate) fn writer(&mut self, table: Table) -> Result<&mut SqliteConnection, StoreError> {
        self.check_scope(table)?;
        Ok(&mut self.tx)
    }

    pub async fn put<T: Serialize + Sync>(
        &mut self,
        table: Table,
        key: &str,
        record: &T,
    ) -> Result<(), StoreError> {
        if !table.is_record_table() {
            return Err(StoreError::NotARecordTable(table.name()));
        }
        let data = serde_json::to_string(record)?;

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (key, data, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
            table.name()
        ))
        .bind(key)
        .bind(data)
        .bind(Utc::now().to_rfc3339())
        .execute(self.writer(table)?)
        .await
        .map_err(|e| map_sqlx_error("put_record", e))?;

        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(
        &mut self,
        table: Table,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        if !table.is_record_table() {
            return Err(StoreError::NotARecordTable(table.name()));
        }

        let row = sqlx::query(&format!("SELECT data FROM {} WHERE key = ?1", table.name()))
            .bind(key)
            .fetch_optional(self.reader())
            .await
            .map_err(|e| map_sqlx_error("get_record", e))?;

        decode_record(row)
    }

    pub async fn delete(&mut self, table: Table, key: &str) -> Result<bool, StoreError> {
        if !table.is_record_table() {
            return Err(StoreError::NotARecordTable(table.name()));
        }

        let result = sqlx::query(&format!("DELETE FROM {} WHERE key = ?1", table.name()))
            .bind(key)
            .execute(self.writer(table)?)
            .await
            .map_err(|e| map_sqlx_error("delete_record", e))?;

        Ok(result.rows_affected() > 0)
    }

    /// Store a blob, enforcing the media quota across all stored blobs.
    pub async fn put_blob(
        &mut self,
        key: &MediaKey,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StoreError> {
        self.check_scope(Table::MediaBlobs)?;

        let others: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(size), 0) FROM media_blobs WHERE key != ?1",
        )
        .bind(key.as_str())
        .fetch_one(self.reader())
        .await
        .map_err(|e| map_sqlx_error("media_usage", e))?;

        let needed = others.max(0) as u64 + bytes.len() as u64;
        if needed > self.media_quota_bytes {
            return Err(StoreError::QuotaExceeded(format!(
                "storing {} needs {} bytes, quota is {} bytes",
                key, needed, self.media_quota_bytes
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO media_blobs (key, content_type, bytes, size, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(key) DO UPDATE SET
                content_type = excluded.content_type,
                bytes = excluded.bytes,
                size = excluded.size
            "#,
        )
        .bind(key.as_str())
        .bind(content_type)
        .bind(bytes)
        .bind(bytes.len() as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(self.writer(Table::MediaBlobs)?)
        .await
        .map_err(|e| map_sqlx_error("put_blob", e))?;

        Ok(())
    }

    pub async fn get_blob(&mut self, key: &MediaKey) -> Result<Option<MediaBlob>, StoreError> {
        let row = sqlx::query("SELECT content_type, bytes FROM media_blobs WHERE key = ?1")
            .bind(key.as_str())
            .fetch_optional(self.reader())
            .await
            .map_err(|e| map_sqlx_error("get_blob", e))?;

        decode_blob(key, row)
    }

    pub async fn delete_blob(&mut self, key: &MediaKey) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM media_blobs WHERE key = ?1")
            .bind(key.as_str())
            .execute(self.writer(Table::MediaBlobs)?)
            .await
            .map_err(|e| map_sqlx_error("delete_blob", e))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    pub async fn rollback(self) {
        if let Err(err) = self.tx.rollback().await {
            tracing::warn!("failed to roll back local store transaction: {err}");
        }
    }
}

fn decode_record<T: DeserializeOwned>(
    row: Option<sqlx::sqlite::SqliteRow>,
) -> Result<Option<T>, StoreError> {
    let Some(row) = row else {
        return Ok(None);
    };
    let data: String = row
        .try_get("data")
        .map_err(|e| map_sqlx_error("decode_record", e))?;
    Ok(Some(serde_json::from_str(&data)?))
}

fn decode_blob(
    key: &MediaKey,
    row: Option<sqlx::sqlite::SqliteRow>,
) -> Result<Option<MediaBlob>, StoreError> {
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(MediaBlob {
        key: key.clone(),
        content_type: row
            .try_get("content_type")
            .map_err(|e| map_sqlx_error("decode_blob", e))?,
        bytes: row
            .try_get("bytes")
            .map_err(|e| map_sqlx_error("decode_blob", e))?,
    }))
}

/// Resolve the default path of the store: `{app_data_dir}/fieldops/offline.db`.
pub fn default_db_path() -> anyhow::Result<PathBuf> {
    let mut dir = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .context("failed to resolve OS app data directory - tried data_dir() and home_dir()/.local/share")?;

    dir.push("fieldops");
    dir.push("offline.db");
    Ok(dir)
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        key         TEXT PRIMARY KEY,
        data        TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS clients (
        key         TEXT PRIMARY KEY,
        data        TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS technicians (
        key         TEXT PRIMARY KEY,
        data        TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS drafts (
        key         TEXT PRIMARY KEY,
        data        TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS media_blobs (
        key           TEXT PRIMARY KEY,
        content_type  TEXT NOT NULL,
        bytes         BLOB NOT NULL,
        size          INTEGER NOT NULL,
        created_at    TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_items (
        seq               INTEGER PRIMARY KEY AUTOINCREMENT,
        id                TEXT NOT NULL UNIQUE,
        entity_type       TEXT NOT NULL,
        entity_id         TEXT NOT NULL,
        operation         TEXT NOT NULL,
        payload           TEXT NOT NULL,
        media_key         TEXT NULL,
        enqueued_at       TEXT NOT NULL,
        retry_count       INTEGER NOT NULL DEFAULT 0,
        max_retries       INTEGER NOT NULL,
        auto_retry_count  INTEGER NOT NULL DEFAULT 0,
        next_attempt_at   INTEGER NOT NULL,
        status            TEXT NOT NULL,
        last_error        TEXT NULL,
        failure_class     TEXT NULL,
        claimed_at        INTEGER NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS queue_items_entity
        ON queue_items (entity_type, entity_id, seq)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS queue_items_status
        ON queue_items (status, seq)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_lease (
        name         TEXT PRIMARY KEY,
        holder       TEXT NOT NULL,
        acquired_at  INTEGER NOT NULL,
        expires_at   INTEGER NOT NULL
    )
    "#,
];
