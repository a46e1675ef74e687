//! Forward-only schema upgrades for the local store.
//!
//! The schema version lives in `PRAGMA user_version`. Every step between the
//! stored version and the target runs inside a single transaction together
//! with the version bump, so a store is always observed at exactly one
//! version.

use sqlx::sqlite::SqliteConnection;
use sqlx::Connection;

use super::StoreError;
use crate::models::PatchKey;
use crate::ops::parse_ops;

/// Schema version produced by this build.
pub const LATEST_VERSION: i64 = 3;

const V1_BASELINE: &str = r#"
CREATE TABLE booleans (
    name TEXT PRIMARY KEY NOT NULL,
    value INTEGER NOT NULL
);

CREATE TABLE numbers (
    name TEXT PRIMARY KEY NOT NULL,
    value INTEGER NOT NULL
);

CREATE TABLE heads (
    name TEXT PRIMARY KEY NOT NULL,
    client_id INTEGER NOT NULL,
    session_id INTEGER NOT NULL,
    patch_id INTEGER NOT NULL
);

CREATE TABLE patches (
    client_id INTEGER NOT NULL,
    session_id INTEGER NOT NULL,
    patch_id INTEGER NOT NULL,
    parent_client_id INTEGER NOT NULL,
    parent_session_id INTEGER NOT NULL,
    parent_patch_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    patch TEXT NOT NULL,
    PRIMARY KEY (client_id, session_id, patch_id)
);

CREATE TABLE snapshots (
    client_id INTEGER NOT NULL,
    session_id INTEGER NOT NULL,
    patch_id INTEGER NOT NULL,
    snapshot TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (client_id, session_id, patch_id)
);

CREATE TABLE pending_patches (
    client_id INTEGER NOT NULL,
    session_id INTEGER NOT NULL,
    patch_id INTEGER NOT NULL,
    PRIMARY KEY (client_id, session_id, patch_id)
);
"#;

const V2_PREPARE: &str = r#"
DROP TABLE booleans;

DELETE FROM numbers WHERE name = 'patch_id';

CREATE TABLE patches_next (
    client_id INTEGER NOT NULL,
    session_id INTEGER NOT NULL,
    patch_id INTEGER NOT NULL,
    parent_client_id INTEGER NOT NULL,
    parent_session_id INTEGER NOT NULL,
    parent_patch_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    ops TEXT NOT NULL CHECK (json_valid(ops)),
    PRIMARY KEY (client_id, session_id, patch_id)
);
"#;

const V2_FINISH: &str = r#"
DROP TABLE patches;

ALTER TABLE patches_next RENAME TO patches;
"#;

const V3_UI_OPEN_SET: &str = r#"
CREATE TABLE ui_calender_open_set (
    id TEXT PRIMARY KEY NOT NULL
);
"#;

#[derive(sqlx::FromRow)]
struct LegacyPatchRow {
    client_id: i64,
    session_id: i64,
    patch_id: i64,
    parent_client_id: i64,
    parent_session_id: i64,
    parent_patch_id: i64,
    created_at: String,
    patch: String,
}

pub(crate) async fn current_version(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(&mut *conn)
        .await
}

/// Upgrades the store behind `conn` to `target`.
///
/// Fails without touching the store if it is newer than this build or newer
/// than `target`.
pub(crate) async fn upgrade(conn: &mut SqliteConnection, target: i64) -> Result<(), StoreError> {
    let from = current_version(conn).await?;
    let fail = |reason: String| StoreError::Migration {
        from,
        to: target,
        reason,
    };

    if from > LATEST_VERSION {
        return Err(fail(format!(
            "store version {} is newer than the supported version {}",
            from, LATEST_VERSION
        )));
    }
    if target > LATEST_VERSION || target < from {
        return Err(fail(format!("cannot move store to version {}", target)));
    }
    if from == target {
        return Ok(());
    }

    run_steps(conn, from, target)
        .await
        .map_err(|e| fail(e.to_string()))?;

    tracing::info!(from, to = target, "upgraded local store schema");
    Ok(())
}

async fn run_steps(conn: &mut SqliteConnection, from: i64, target: i64) -> Result<(), StoreError> {
    let mut tx = conn.begin().await?;

    for version in (from + 1)..=target {
        tracing::debug!(version, "applying local store migration");
        match version {
            1 => {
                sqlx::raw_sql(V1_BASELINE).execute(&mut *tx).await?;
            }
            2 => structure_patch_ops(&mut tx).await?,
            3 => {
                sqlx::raw_sql(V3_UI_OPEN_SET).execute(&mut *tx).await?;
            }
            _ => unreachable!("target is bounded by LATEST_VERSION"),
        }
    }

    // PRAGMA does not accept bound parameters.
    sqlx::raw_sql(&format!("PRAGMA user_version = {}", target))
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// V1 -> V2: replaces the serialized `patch` column with structured `ops`.
async fn structure_patch_ops(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    sqlx::raw_sql(V2_PREPARE).execute(&mut *conn).await?;

    let rows: Vec<LegacyPatchRow> = sqlx::query_as(
        r#"
        SELECT client_id, session_id, patch_id,
               parent_client_id, parent_session_id, parent_patch_id,
               created_at, patch
        FROM patches
        ORDER BY rowid
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    for row in &rows {
        let key = PatchKey::new(row.client_id, row.session_id, row.patch_id);
        let ops = parse_ops(&row.patch).map_err(|e| StoreError::corrupt(key, e))?;
        let ops = serde_json::to_string(&ops).map_err(|e| StoreError::corrupt(key, e))?;

        sqlx::query(
            r#"
            INSERT INTO patches_next (
                client_id, session_id, patch_id,
                parent_client_id, parent_session_id, parent_patch_id,
                created_at, ops
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.client_id)
        .bind(row.session_id)
        .bind(row.patch_id)
        .bind(row.parent_client_id)
        .bind(row.parent_session_id)
        .bind(row.parent_patch_id)
        .bind(&row.created_at)
        .bind(&ops)
        .execute(&mut *conn)
        .await?;
    }

    sqlx::raw_sql(V2_FINISH).execute(&mut *conn).await?;
    tracing::debug!(patches = rows.len(), "converted legacy patch strings");
    Ok(())
}
