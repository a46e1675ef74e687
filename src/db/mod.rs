//! Versioned local store.
//!
//! All replicated state of one device lives in a single SQLite file. The
//! schema is upgraded forward-only by [`migrations`] before the connection
//! pool is handed out, so every [`LocalStore`] a caller sees is at the
//! requested version.

mod chain;
mod migrations;
mod store;

pub use chain::ReplayPlan;
pub use migrations::LATEST_VERSION;

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::models::{HeadName, PatchKey};
use crate::ops::OpError;

/// Errors raised by the local store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to create store directory '{}': {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    /// A referenced patch is missing from the store.
    #[error("patch {0} not found in local store")]
    NotFound(PatchKey),

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("migration from version {from} to {to} failed: {reason}")]
    Migration { from: i64, to: i64, reason: String },

    #[error("failed to apply patch operations: {0}")]
    Apply(#[from] OpError),
}

impl StoreError {
    pub(crate) fn corrupt(key: impl ToString, reason: impl ToString) -> Self {
        StoreError::Corrupt {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Handle to an opened, fully migrated local store.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    path: PathBuf,
}

#[derive(sqlx::FromRow)]
struct HeadRow {
    client_id: i64,
    session_id: i64,
    patch_id: i64,
}

impl From<HeadRow> for PatchKey {
    fn from(row: HeadRow) -> Self {
        PatchKey::new(row.client_id, row.session_id, row.patch_id)
    }
}

impl LocalStore {
    /// Opens the store at `path`, creating it if needed, and upgrades it to
    /// the latest schema version.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_at_version(path, LATEST_VERSION).await
    }

    /// Opens the store and upgrades it only up to `version`.
    pub async fn open_at_version(path: impl AsRef<Path>, version: i64) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(parent.to_path_buf(), e))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // Upgrade on a dedicated connection; the pool only exists afterwards.
        let mut conn = SqliteConnection::connect_with(&options).await?;
        let upgraded = migrations::upgrade(&mut conn, version).await;
        conn.close().await?;
        upgraded?;

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        tracing::debug!(path = %path.display(), version, "opened local store");
        Ok(Self { pool, path })
    }

    /// Closes every pooled connection.
    pub async fn close(self) {
        self.pool.close().await;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Schema version recorded in the store.
    pub async fn version(&self) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(migrations::current_version(&mut conn).await?)
    }

    /// Names of all user tables, sorted.
    pub async fn store_names(&self) -> Result<Vec<String>, StoreError> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    // ── Numbers ───────────────────────────────────────────────────────────

    pub async fn get_number(&self, name: &str) -> Result<Option<i64>, StoreError> {
        let value = sqlx::query_scalar("SELECT value FROM numbers WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn put_number(&self, name: &str, value: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO numbers (name, value) VALUES (?, ?) ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Increments `name` and returns the new value. A missing number counts
    /// as 0.
    pub async fn increment_number(&self, name: &str) -> Result<i64, StoreError> {
        let value = sqlx::query_scalar(
            r#"
            INSERT INTO numbers (name, value) VALUES (?, 1)
            ON CONFLICT(name) DO UPDATE SET value = value + 1
            RETURNING value
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }

    // ── Heads ─────────────────────────────────────────────────────────────

    pub async fn get_head(&self, name: HeadName) -> Result<Option<PatchKey>, StoreError> {
        let row: Option<HeadRow> = sqlx::query_as(
            "SELECT client_id, session_id, patch_id FROM heads WHERE name = ?",
        )
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(PatchKey::from))
    }

    pub async fn put_head(&self, name: HeadName, key: PatchKey) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        write_head(&mut conn, name, key).await
    }

    /// Moves both heads in one transaction.
    pub async fn put_heads(&self, local: PatchKey, remote: PatchKey) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        write_head(&mut tx, HeadName::Local, local).await?;
        write_head(&mut tx, HeadName::Remote, remote).await?;
        tx.commit().await?;
        Ok(())
    }

    // ── UI open set ───────────────────────────────────────────────────────

    pub async fn ui_open_set_add(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO ui_calender_open_set (id) VALUES (?)")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn ui_open_set_remove(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM ui_calender_open_set WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn ui_open_set_list(&self) -> Result<Vec<String>, StoreError> {
        let ids = sqlx::query_scalar("SELECT id FROM ui_calender_open_set ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

pub(crate) async fn write_head(
    conn: &mut SqliteConnection,
    name: HeadName,
    key: PatchKey,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO heads (name, client_id, session_id, patch_id) VALUES (?, ?, ?, ?)
        ON CONFLICT(name) DO UPDATE SET
            client_id = excluded.client_id,
            session_id = excluded.session_id,
            patch_id = excluded.patch_id
        "#,
    )
    .bind(name.as_str())
    .bind(key.client_id)
    .bind(key.session_id)
    .bind(key.patch_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) struct TestStore {
        pub store: LocalStore,
        // Keep temp dir alive for the test duration
        pub _dir: TempDir,
    }

    pub(crate) async fn setup() -> TestStore {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path().join("local.db")).await.unwrap();
        TestStore { store, _dir: dir }
    }

    #[tokio::test]
    async fn test_open_creates_parent_dir_and_latest_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("local.db");

        let store = LocalStore::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.version().await.unwrap(), LATEST_VERSION);
    }

    #[tokio::test]
    async fn test_reopen_is_noop() {
        let ctx = setup().await;
        ctx.store.put_number("client_id", 4).await.unwrap();
        let path = ctx.store.path().to_path_buf();
        ctx.store.close().await;

        let store = LocalStore::open(&path).await.unwrap();
        assert_eq!(store.get_number("client_id").await.unwrap(), Some(4));
        assert_eq!(store.version().await.unwrap(), LATEST_VERSION);
    }

    #[tokio::test]
    async fn test_numbers() {
        let ctx = setup().await;
        let store = &ctx.store;

        assert_eq!(store.get_number("session_id").await.unwrap(), None);
        assert_eq!(store.increment_number("session_id").await.unwrap(), 1);
        assert_eq!(store.increment_number("session_id").await.unwrap(), 2);

        store.put_number("session_id", 10).await.unwrap();
        assert_eq!(store.increment_number("session_id").await.unwrap(), 11);
        assert_eq!(store.get_number("session_id").await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn test_heads() {
        let ctx = setup().await;
        let store = &ctx.store;

        assert_eq!(store.get_head(HeadName::Local).await.unwrap(), None);

        store.put_heads(PatchKey::ROOT, PatchKey::ROOT).await.unwrap();
        let key = PatchKey::new(1, 2, 3);
        store.put_head(HeadName::Local, key).await.unwrap();

        assert_eq!(store.get_head(HeadName::Local).await.unwrap(), Some(key));
        assert_eq!(
            store.get_head(HeadName::Remote).await.unwrap(),
            Some(PatchKey::ROOT)
        );
    }

    #[tokio::test]
    async fn test_ui_open_set() {
        let ctx = setup().await;
        let store = &ctx.store;

        store.ui_open_set_add("b").await.unwrap();
        store.ui_open_set_add("a").await.unwrap();
        store.ui_open_set_add("a").await.unwrap();
        assert_eq!(store.ui_open_set_list().await.unwrap(), vec!["a", "b"]);

        assert!(store.ui_open_set_remove("a").await.unwrap());
        assert!(!store.ui_open_set_remove("a").await.unwrap());
        assert_eq!(store.ui_open_set_list().await.unwrap(), vec!["b"]);
    }
}
