//! Server-side patch storage.
//!
//! One SQLite database holds every user's patches, registered clients, the
//! per-client delivery queue and the shared head. Create-by-key is
//! idempotent: re-inserting a stored patch changes nothing and enqueues
//! nothing.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};

use crate::models::{Patch, PatchKey};
use crate::ops::PatchOp;
use crate::sync::protocol::HeadResponse;

/// Client id reserved for the system-produced root patch.
pub const SYSTEM_CLIENT_ID: i64 = 0;

/// Errors that can occur during server storage operations.
#[derive(Debug)]
pub enum ServerStorageError {
    /// I/O error preparing the database location.
    IoError(PathBuf, std::io::Error),
    /// Error talking to the database.
    Database(sqlx::Error),
    /// Error applying the schema.
    Migrate(sqlx::migrate::MigrateError),
    /// No such user.
    UserNotFound(i64),
    /// A head update named a patch the server does not have.
    UnknownPatch(PatchKey),
    /// A stored row could not be decoded.
    Corrupt(PatchKey, String),
}

impl std::fmt::Display for ServerStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStorageError::IoError(path, e) => {
                write!(f, "I/O error for {}: {}", path.display(), e)
            }
            ServerStorageError::Database(e) => write!(f, "Database error: {}", e),
            ServerStorageError::Migrate(e) => write!(f, "Failed to migrate database: {}", e),
            ServerStorageError::UserNotFound(id) => write!(f, "User {} not found", id),
            ServerStorageError::UnknownPatch(key) => write!(f, "Unknown patch {}", key),
            ServerStorageError::Corrupt(key, e) => write!(f, "Corrupt patch {}: {}", key, e),
        }
    }
}

impl std::error::Error for ServerStorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerStorageError::IoError(_, e) => Some(e),
            ServerStorageError::Database(e) => Some(e),
            ServerStorageError::Migrate(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for ServerStorageError {
    fn from(e: sqlx::Error) -> Self {
        ServerStorageError::Database(e)
    }
}

impl From<sqlx::migrate::MigrateError> for ServerStorageError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        ServerStorageError::Migrate(e)
    }
}

#[derive(sqlx::FromRow)]
struct PatchRow {
    client_id: i64,
    session_id: i64,
    patch_id: i64,
    parent_client_id: i64,
    parent_session_id: i64,
    parent_patch_id: i64,
    created_at: String,
    ops: String,
}

impl PatchRow {
    fn into_patch(self) -> Result<Patch, ServerStorageError> {
        let patch_key = PatchKey::new(self.client_id, self.session_id, self.patch_id);
        let ops: Vec<PatchOp> = serde_json::from_str(&self.ops)
            .map_err(|e| ServerStorageError::Corrupt(patch_key, e.to_string()))?;
        Ok(Patch {
            patch_key,
            parent_patch_key: PatchKey::new(
                self.parent_client_id,
                self.parent_session_id,
                self.parent_patch_id,
            ),
            created_at: parse_timestamp(patch_key, &self.created_at)?,
            ops,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HeadRow {
    client_id: i64,
    session_id: i64,
    patch_id: i64,
    created_at: String,
    name: String,
}

fn parse_timestamp(key: PatchKey, s: &str) -> Result<DateTime<Utc>, ServerStorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ServerStorageError::Corrupt(key, e.to_string()))
}

/// Server-side storage for users' patch histories.
#[derive(Debug, Clone)]
pub struct ServerStorage {
    pool: SqlitePool,
}

impl ServerStorage {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ServerStorageError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| ServerStorageError::IoError(parent.to_path_buf(), e))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    async fn ensure_user(&self, user_id: i64) -> Result<(), ServerStorageError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        found
            .map(|_| ())
            .ok_or(ServerStorageError::UserNotFound(user_id))
    }

    /// Creates a user with the system client, the root patch and the head on
    /// the root. Returns `false` if the user already exists.
    pub async fn create_user(&self, user_id: i64) -> Result<bool, ServerStorageError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query(
            "INSERT OR IGNORE INTO users (id, created_at, updated_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;
        if !created {
            return Ok(false);
        }

        sqlx::query("INSERT INTO clients (user_id, client_id, name, created_at) VALUES (?, ?, 'System', ?)")
            .bind(user_id)
            .bind(SYSTEM_CLIENT_ID)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

        let root = Patch::root();
        insert_patch(&mut tx, user_id, &root).await?;

        tx.commit().await?;
        tracing::info!(user_id, "created user");
        Ok(true)
    }

    /// Registers a client and queues every existing patch it did not produce
    /// for delivery to it.
    pub async fn create_client(&self, user_id: i64, name: &str) -> Result<i64, ServerStorageError> {
        self.ensure_user(user_id).await?;
        let mut tx = self.pool.begin().await?;

        let client_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO clients (user_id, client_id, name, created_at)
            SELECT ?, COALESCE(MAX(client_id), 0) + 1, ?, ? FROM clients WHERE user_id = ?
            RETURNING client_id
            "#,
        )
        .bind(user_id)
        .bind(name)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        let seeded = sqlx::query(
            r#"
            INSERT OR IGNORE INTO pending_patches (user_id, consumer_client_id, client_id, session_id, patch_id)
            SELECT user_id, ?, client_id, session_id, patch_id
            FROM patches
            WHERE user_id = ? AND client_id != ?
            ORDER BY rowid
            "#,
        )
        .bind(client_id)
        .bind(user_id)
        .bind(client_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        tracing::info!(user_id, client_id, name, seeded, "created client");
        Ok(client_id)
    }

    /// Stores patches by key. Each newly stored patch is queued for every
    /// other non-system client. Returns how many patches were new.
    pub async fn create_patches(
        &self,
        user_id: i64,
        patches: &[Patch],
    ) -> Result<usize, ServerStorageError> {
        self.ensure_user(user_id).await?;
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for patch in patches {
            if !insert_patch(&mut tx, user_id, patch).await? {
                continue;
            }
            inserted += 1;

            sqlx::query(
                r#"
                INSERT OR IGNORE INTO pending_patches (user_id, consumer_client_id, client_id, session_id, patch_id)
                SELECT user_id, client_id, ?, ?, ?
                FROM clients
                WHERE user_id = ? AND client_id != ? AND client_id != ?
                "#,
            )
            .bind(patch.patch_key.client_id)
            .bind(patch.patch_key.session_id)
            .bind(patch.patch_key.patch_id)
            .bind(user_id)
            .bind(SYSTEM_CLIENT_ID)
            .bind(patch.patch_key.client_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(user_id, received = patches.len(), inserted, "stored patches");
        Ok(inserted)
    }

    /// Patches queued for `client_id`, oldest first.
    pub async fn pending_patches(
        &self,
        user_id: i64,
        client_id: i64,
        limit: usize,
    ) -> Result<Vec<Patch>, ServerStorageError> {
        self.ensure_user(user_id).await?;
        let rows: Vec<PatchRow> = sqlx::query_as(
            r#"
            SELECT p.client_id, p.session_id, p.patch_id,
                   p.parent_client_id, p.parent_session_id, p.parent_patch_id,
                   p.created_at, p.ops
            FROM pending_patches q
            JOIN patches p
              ON p.user_id = q.user_id
             AND p.client_id = q.client_id
             AND p.session_id = q.session_id
             AND p.patch_id = q.patch_id
            WHERE q.user_id = ? AND q.consumer_client_id = ?
            ORDER BY q.seq
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(client_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PatchRow::into_patch).collect()
    }

    pub async fn delete_pending_patches(
        &self,
        user_id: i64,
        client_id: i64,
        keys: &[PatchKey],
    ) -> Result<u64, ServerStorageError> {
        self.ensure_user(user_id).await?;
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;

        for key in keys {
            deleted += sqlx::query(
                r#"
                DELETE FROM pending_patches
                WHERE user_id = ? AND consumer_client_id = ?
                  AND client_id = ? AND session_id = ? AND patch_id = ?
                "#,
            )
            .bind(user_id)
            .bind(client_id)
            .bind(key.client_id)
            .bind(key.session_id)
            .bind(key.patch_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(deleted)
    }

    pub async fn head(&self, user_id: i64) -> Result<HeadResponse, ServerStorageError> {
        let row: Option<HeadRow> = sqlx::query_as(
            r#"
            SELECT u.head_client_id AS client_id,
                   u.head_session_id AS session_id,
                   u.head_patch_id AS patch_id,
                   p.created_at AS created_at,
                   COALESCE(c.name, '') AS name
            FROM users u
            JOIN patches p
              ON p.user_id = u.id
             AND p.client_id = u.head_client_id
             AND p.session_id = u.head_session_id
             AND p.patch_id = u.head_patch_id
            LEFT JOIN clients c
              ON c.user_id = u.id AND c.client_id = u.head_client_id
            WHERE u.id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(ServerStorageError::UserNotFound(user_id))?;
        let key = PatchKey::new(row.client_id, row.session_id, row.patch_id);
        Ok(HeadResponse {
            client_id: row.client_id,
            session_id: row.session_id,
            patch_id: row.patch_id,
            created_at: parse_timestamp(key, &row.created_at)?,
            name: row.name,
        })
    }

    /// Moves the head to `new_head` if it currently equals `expected` (or
    /// unconditionally when `expected` is `None`). Returns whether the head
    /// was written.
    pub async fn update_head(
        &self,
        user_id: i64,
        new_head: PatchKey,
        expected: Option<PatchKey>,
    ) -> Result<bool, ServerStorageError> {
        self.ensure_user(user_id).await?;

        let known: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM patches WHERE user_id = ? AND client_id = ? AND session_id = ? AND patch_id = ?",
        )
        .bind(user_id)
        .bind(new_head.client_id)
        .bind(new_head.session_id)
        .bind(new_head.patch_id)
        .fetch_optional(&self.pool)
        .await?;
        if known.is_none() {
            return Err(ServerStorageError::UnknownPatch(new_head));
        }

        let now = Utc::now().to_rfc3339();
        let result = match expected {
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE users
                    SET head_client_id = ?, head_session_id = ?, head_patch_id = ?, updated_at = ?
                    WHERE id = ? AND head_client_id = ? AND head_session_id = ? AND head_patch_id = ?
                    "#,
                )
                .bind(new_head.client_id)
                .bind(new_head.session_id)
                .bind(new_head.patch_id)
                .bind(&now)
                .bind(user_id)
                .bind(expected.client_id)
                .bind(expected.session_id)
                .bind(expected.patch_id)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE users
                    SET head_client_id = ?, head_session_id = ?, head_patch_id = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(new_head.client_id)
                .bind(new_head.session_id)
                .bind(new_head.patch_id)
                .bind(&now)
                .bind(user_id)
                .execute(&self.pool)
                .await?
            }
        };

        let updated = result.rows_affected() > 0;
        tracing::debug!(user_id, head = %new_head, conditional = expected.is_some(), updated, "head update");
        Ok(updated)
    }
}

async fn insert_patch(
    conn: &mut sqlx::SqliteConnection,
    user_id: i64,
    patch: &Patch,
) -> Result<bool, ServerStorageError> {
    let ops = serde_json::to_string(&patch.ops)
        .map_err(|e| ServerStorageError::Corrupt(patch.patch_key, e.to_string()))?;

    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO patches (
            user_id, client_id, session_id, patch_id,
            parent_client_id, parent_session_id, parent_patch_id,
            created_at, ops
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(patch.patch_key.client_id)
    .bind(patch.patch_key.session_id)
    .bind(patch.patch_key.patch_id)
    .bind(patch.parent_patch_key.client_id)
    .bind(patch.parent_patch_key.session_id)
    .bind(patch.parent_patch_key.patch_id)
    .bind(patch.created_at.to_rfc3339())
    .bind(&ops)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}
