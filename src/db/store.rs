//! Patch, snapshot and pending-queue persistence.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;

use super::{write_head, LocalStore, StoreError};
use crate::models::{HeadName, Patch, PatchKey, Snapshot};
use crate::ops::PatchOp;

// Row types for database queries
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

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    snapshot: String,
    created_at: String,
}

#[derive(sqlx::FromRow)]
struct KeyRow {
    client_id: i64,
    session_id: i64,
    patch_id: i64,
}

impl PatchRow {
    fn into_patch(self) -> Result<Patch, StoreError> {
        let patch_key = PatchKey::new(self.client_id, self.session_id, self.patch_id);
        let ops: Vec<PatchOp> =
            serde_json::from_str(&self.ops).map_err(|e| StoreError::corrupt(patch_key, e))?;
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

fn parse_timestamp(key: PatchKey, s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(key, e))
}

pub(crate) async fn read_patch(
    conn: &mut SqliteConnection,
    key: PatchKey,
) -> Result<Option<Patch>, StoreError> {
    let row: Option<PatchRow> = sqlx::query_as(
        r#"
        SELECT client_id, session_id, patch_id,
               parent_client_id, parent_session_id, parent_patch_id,
               created_at, ops
        FROM patches
        WHERE client_id = ? AND session_id = ? AND patch_id = ?
        "#,
    )
    .bind(key.client_id)
    .bind(key.session_id)
    .bind(key.patch_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(PatchRow::into_patch).transpose()
}

pub(crate) async fn read_snapshot(
    conn: &mut SqliteConnection,
    key: PatchKey,
) -> Result<Option<Snapshot>, StoreError> {
    let row: Option<SnapshotRow> = sqlx::query_as(
        "SELECT snapshot, created_at FROM snapshots WHERE client_id = ? AND session_id = ? AND patch_id = ?",
    )
    .bind(key.client_id)
    .bind(key.session_id)
    .bind(key.patch_id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Ok(Some(Snapshot {
            patch_key: key,
            snapshot: serde_json::from_str(&row.snapshot)
                .map_err(|e| StoreError::corrupt(key, e))?,
            created_at: parse_timestamp(key, &row.created_at)?,
        })),
        None => Ok(None),
    }
}

/// Inserts `patch` unless its key is already stored. Returns whether a row
/// was written.
pub(crate) async fn insert_patch(
    conn: &mut SqliteConnection,
    patch: &Patch,
) -> Result<bool, StoreError> {
    let ops = serde_json::to_string(&patch.ops)
        .map_err(|e| StoreError::corrupt(patch.patch_key, e))?;

    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO patches (
            client_id, session_id, patch_id,
            parent_client_id, parent_session_id, parent_patch_id,
            created_at, ops
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
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

async fn insert_pending(conn: &mut SqliteConnection, key: PatchKey) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT OR IGNORE INTO pending_patches (client_id, session_id, patch_id) VALUES (?, ?, ?)",
    )
    .bind(key.client_id)
    .bind(key.session_id)
    .bind(key.patch_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_pending(conn: &mut SqliteConnection, key: PatchKey) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "DELETE FROM pending_patches WHERE client_id = ? AND session_id = ? AND patch_id = ?",
    )
    .bind(key.client_id)
    .bind(key.session_id)
    .bind(key.patch_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

impl LocalStore {
    // ── Patches ───────────────────────────────────────────────────────────

    /// Stores `patch`; an existing key is left untouched.
    pub async fn put_patch(&self, patch: &Patch) -> Result<bool, StoreError> {
        let mut conn = self.pool().acquire().await?;
        insert_patch(&mut conn, patch).await
    }

    pub async fn get_patch(&self, key: PatchKey) -> Result<Option<Patch>, StoreError> {
        let mut conn = self.pool().acquire().await?;
        read_patch(&mut conn, key).await
    }

    pub async fn has_patch(&self, key: PatchKey) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM patches WHERE client_id = ? AND session_id = ? AND patch_id = ?",
        )
        .bind(key.client_id)
        .bind(key.session_id)
        .bind(key.patch_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(found.is_some())
    }

    // ── Pending queue ─────────────────────────────────────────────────────

    /// Persists a locally created patch, queues it for upload and advances
    /// the local head to it, all in one transaction.
    pub async fn enqueue(&self, patch: &Patch) -> Result<(), StoreError> {
        self.enqueue_all(std::slice::from_ref(patch)).await
    }

    /// Like [`enqueue`](Self::enqueue) for a run of patches; the local head
    /// ends on the last one.
    pub async fn enqueue_all(&self, patches: &[Patch]) -> Result<(), StoreError> {
        self.enqueue_replacing(patches, &[]).await
    }

    /// Like [`enqueue_all`](Self::enqueue_all), and in the same transaction
    /// drops `superseded` from the upload queue. The superseded patches stay
    /// stored.
    pub async fn enqueue_replacing(
        &self,
        patches: &[Patch],
        superseded: &[PatchKey],
    ) -> Result<(), StoreError> {
        let Some(last) = patches.last() else {
            return Ok(());
        };

        let mut tx = self.pool().begin().await?;
        for key in superseded {
            delete_pending(&mut tx, *key).await?;
        }
        for patch in patches {
            insert_patch(&mut tx, patch).await?;
            insert_pending(&mut tx, patch.patch_key).await?;
        }
        write_head(&mut tx, HeadName::Local, last.patch_key).await?;
        tx.commit().await?;

        tracing::debug!(count = patches.len(), head = %last.patch_key, "enqueued patches");
        Ok(())
    }

    /// Oldest-first keys of queued patches.
    pub async fn pending_keys(&self, limit: usize) -> Result<Vec<PatchKey>, StoreError> {
        let rows: Vec<KeyRow> = sqlx::query_as(
            "SELECT client_id, session_id, patch_id FROM pending_patches ORDER BY rowid LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| PatchKey::new(r.client_id, r.session_id, r.patch_id))
            .collect())
    }

    /// Oldest-first queued patches. A queued key without a stored patch is
    /// reported as [`StoreError::NotFound`].
    pub async fn pending_patches(&self, limit: usize) -> Result<Vec<Patch>, StoreError> {
        let keys = self.pending_keys(limit).await?;
        let mut conn = self.pool().acquire().await?;

        let mut patches = Vec::with_capacity(keys.len());
        for key in keys {
            let patch = read_patch(&mut conn, key)
                .await?
                .ok_or(StoreError::NotFound(key))?;
            patches.push(patch);
        }
        Ok(patches)
    }

    pub async fn pending_count(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM pending_patches")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Drops acknowledged keys from the queue. Returns how many were queued.
    pub async fn remove_pending(&self, keys: &[PatchKey]) -> Result<u64, StoreError> {
        let mut tx = self.pool().begin().await?;
        let mut removed = 0;
        for key in keys {
            removed += delete_pending(&mut tx, *key).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    // ── Snapshots ─────────────────────────────────────────────────────────

    /// Appends a snapshot. Snapshots are never replaced.
    pub async fn put_snapshot(&self, snapshot: &Snapshot) -> Result<bool, StoreError> {
        let body = serde_json::to_string(&snapshot.snapshot)
            .map_err(|e| StoreError::corrupt(snapshot.patch_key, e))?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO snapshots (client_id, session_id, patch_id, snapshot, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(snapshot.patch_key.client_id)
        .bind(snapshot.patch_key.session_id)
        .bind(snapshot.patch_key.patch_id)
        .bind(&body)
        .bind(snapshot.created_at.to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_snapshot(&self, key: PatchKey) -> Result<Option<Snapshot>, StoreError> {
        let mut conn = self.pool().acquire().await?;
        read_snapshot(&mut conn, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::setup;
    use serde_json::json;

    fn add(path: &str, value: serde_json::Value) -> PatchOp {
        PatchOp::Add {
            path: path.to_string(),
            value,
        }
    }

    #[tokio::test]
    async fn test_put_patch_is_idempotent() {
        let ctx = setup().await;
        let store = &ctx.store;

        let patch = Patch::new(PatchKey::new(1, 0, 0), PatchKey::ROOT, vec![add("/a", json!(1))]);
        assert!(store.put_patch(&patch).await.unwrap());

        let mut changed = patch.clone();
        changed.ops = vec![add("/b", json!(2))];
        assert!(!store.put_patch(&changed).await.unwrap());

        let stored = store.get_patch(patch.patch_key).await.unwrap().unwrap();
        assert_eq!(stored.ops, patch.ops);
        assert!(store.has_patch(patch.patch_key).await.unwrap());
        assert!(!store.has_patch(PatchKey::new(9, 9, 9)).await.unwrap());
    }

    #[tokio::test]
    async fn test_enqueue_moves_local_head_and_queues() {
        let ctx = setup().await;
        let store = &ctx.store;

        let p1 = Patch::new(PatchKey::new(1, 0, 0), PatchKey::ROOT, vec![add("/a", json!(1))]);
        let p2 = Patch::new(PatchKey::new(1, 0, 1), p1.patch_key, vec![add("/b", json!(2))]);
        store.enqueue(&p1).await.unwrap();
        store.enqueue(&p2).await.unwrap();

        assert_eq!(
            store.get_head(HeadName::Local).await.unwrap(),
            Some(p2.patch_key)
        );
        assert_eq!(store.pending_count().await.unwrap(), 2);
        assert_eq!(
            store.pending_keys(10).await.unwrap(),
            vec![p1.patch_key, p2.patch_key]
        );
        assert_eq!(store.pending_patches(1).await.unwrap(), vec![p1.clone()]);
    }

    #[tokio::test]
    async fn test_enqueue_all_is_atomic() {
        let ctx = setup().await;
        let store = &ctx.store;

        // Drop the queue table so the second statement of the transaction fails.
        sqlx::query("DROP TABLE pending_patches")
            .execute(store.pool())
            .await
            .unwrap();

        let p = Patch::new(PatchKey::new(1, 0, 0), PatchKey::ROOT, vec![]);
        assert!(store.enqueue(&p).await.is_err());
        assert!(!store.has_patch(p.patch_key).await.unwrap());
        assert_eq!(store.get_head(HeadName::Local).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_pending() {
        let ctx = setup().await;
        let store = &ctx.store;

        let p1 = Patch::new(PatchKey::new(1, 0, 0), PatchKey::ROOT, vec![]);
        let p2 = Patch::new(PatchKey::new(1, 0, 1), p1.patch_key, vec![]);
        store.enqueue_all(&[p1.clone(), p2.clone()]).await.unwrap();

        let removed = store
            .remove_pending(&[p1.patch_key, PatchKey::new(5, 5, 5)])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.pending_keys(10).await.unwrap(), vec![p2.patch_key]);

        // Acknowledged patches stay in the log
        assert!(store.has_patch(p1.patch_key).await.unwrap());
    }

    #[tokio::test]
    async fn test_enqueue_replacing_drops_superseded_from_queue() {
        let ctx = setup().await;
        let store = &ctx.store;

        let old = Patch::new(PatchKey::new(1, 1, 0), PatchKey::ROOT, vec![add("/a", json!(1))]);
        store.enqueue(&old).await.unwrap();

        let base = Patch::new(PatchKey::new(2, 1, 0), PatchKey::ROOT, vec![]);
        store.put_patch(&base).await.unwrap();
        let copy = Patch::new(PatchKey::new(1, 2, 0), base.patch_key, old.ops.clone());
        store
            .enqueue_replacing(&[copy.clone()], &[old.patch_key])
            .await
            .unwrap();

        assert_eq!(store.pending_keys(10).await.unwrap(), vec![copy.patch_key]);
        assert!(store.has_patch(old.patch_key).await.unwrap());
        assert_eq!(
            store.get_head(HeadName::Local).await.unwrap(),
            Some(copy.patch_key)
        );
    }

    #[tokio::test]
    async fn test_pending_without_patch_is_not_found() {
        let ctx = setup().await;
        let store = &ctx.store;

        sqlx::query("INSERT INTO pending_patches (client_id, session_id, patch_id) VALUES (3, 3, 3)")
            .execute(store.pool())
            .await
            .unwrap();

        let err = store.pending_patches(10).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(k) if k == PatchKey::new(3, 3, 3)));
    }

    #[tokio::test]
    async fn test_snapshots_are_append_only() {
        let ctx = setup().await;
        let store = &ctx.store;

        let key = PatchKey::new(1, 0, 4);
        let first = Snapshot {
            patch_key: key,
            snapshot: json!({ "data": { "n": 1 } }),
            created_at: Utc::now(),
        };
        assert!(store.put_snapshot(&first).await.unwrap());

        let second = Snapshot {
            snapshot: json!({ "data": { "n": 2 } }),
            ..first.clone()
        };
        assert!(!store.put_snapshot(&second).await.unwrap());

        let stored = store.get_snapshot(key).await.unwrap().unwrap();
        assert_eq!(stored.snapshot, first.snapshot);
        assert_eq!(store.get_snapshot(PatchKey::ROOT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_ops_reported() {
        let ctx = setup().await;
        let store = &ctx.store;

        sqlx::query(
            r#"INSERT INTO patches VALUES (2, 0, 0, 0, 0, 0, '2024-01-01T00:00:00Z', '[{"op":"nope"}]')"#,
        )
        .execute(store.pool())
        .await
        .unwrap();

        let err = store.get_patch(PatchKey::new(2, 0, 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
