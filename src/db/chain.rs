//! Materializing documents from the parent-linked patch chain.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;

use super::store::{read_patch, read_snapshot};
use super::{LocalStore, StoreError};
use crate::models::{Patch, PatchKey, Snapshot};
use crate::ops::{self, PatchOp};

/// What has to be replayed to materialize a head: a base document and the
/// operations to apply to it, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayPlan {
    pub snapshot: Value,
    pub ops: Vec<PatchOp>,
    /// Number of patches between the base and the head.
    pub depth: usize,
}

impl LocalStore {
    /// Walks parent links from `head` back to the nearest snapshot or to the
    /// root patch.
    pub async fn get_patches_for_local_head(&self, head: PatchKey) -> Result<ReplayPlan, StoreError> {
        // One read transaction so the walk sees a consistent chain.
        let mut tx = self.pool().begin().await?;

        let mut batches: Vec<Vec<PatchOp>> = Vec::new();
        let mut visited = HashSet::new();
        let mut key = head;

        let base = loop {
            if !visited.insert(key) {
                return Err(StoreError::corrupt(key, "parent chain contains a cycle"));
            }
            if let Some(snapshot) = read_snapshot(&mut tx, key).await? {
                break snapshot.snapshot;
            }

            let patch = read_patch(&mut tx, key)
                .await?
                .ok_or(StoreError::NotFound(key))?;
            let is_root = patch.is_root();
            let parent = patch.parent_patch_key;
            batches.push(patch.ops);

            if is_root {
                break ops::empty_document();
            }
            key = parent;
        };
        tx.commit().await?;

        // Collected newest first; replay needs oldest first.
        let depth = batches.len();
        let ops = batches.into_iter().rev().flatten().collect();

        Ok(ReplayPlan {
            snapshot: base,
            ops,
            depth,
        })
    }

    /// Materializes the document at `head`. When at least
    /// `snapshot_interval` patches had to be replayed a snapshot is stored at
    /// `head`; an interval of 0 disables snapshots.
    pub async fn materialize(
        &self,
        head: PatchKey,
        snapshot_interval: usize,
    ) -> Result<Value, StoreError> {
        let plan = self.get_patches_for_local_head(head).await?;
        let doc = ops::apply(plan.snapshot, &plan.ops)?;

        if snapshot_interval > 0 && plan.depth >= snapshot_interval {
            let snapshot = Snapshot {
                patch_key: head,
                snapshot: doc.clone(),
                created_at: Utc::now(),
            };
            if self.put_snapshot(&snapshot).await? {
                tracing::debug!(%head, depth = plan.depth, "stored snapshot");
            }
        }

        Ok(doc)
    }

    /// Keys on the chain from `key` up to and including the root.
    pub async fn ancestors(&self, key: PatchKey) -> Result<HashSet<PatchKey>, StoreError> {
        let mut conn = self.pool().acquire().await?;
        let mut seen = HashSet::new();
        let mut current = key;

        loop {
            if !seen.insert(current) {
                return Err(StoreError::corrupt(current, "parent chain contains a cycle"));
            }
            let patch = read_patch(&mut conn, current)
                .await?
                .ok_or(StoreError::NotFound(current))?;
            if patch.is_root() {
                return Ok(seen);
            }
            current = patch.parent_patch_key;
        }
    }

    /// Patches from `head` back to (excluding) the first key in `base`,
    /// oldest first. A root patch is never included.
    pub async fn patches_since(
        &self,
        head: PatchKey,
        base: &HashSet<PatchKey>,
    ) -> Result<Vec<Patch>, StoreError> {
        let mut conn = self.pool().acquire().await?;
        let mut branch = Vec::new();
        let mut seen = HashSet::new();
        let mut current = head;

        while !base.contains(&current) {
            if !seen.insert(current) {
                return Err(StoreError::corrupt(current, "parent chain contains a cycle"));
            }
            let patch = read_patch(&mut conn, current)
                .await?
                .ok_or(StoreError::NotFound(current))?;
            if patch.is_root() {
                break;
            }
            current = patch.parent_patch_key;
            branch.push(patch);
        }

        branch.reverse();
        Ok(branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::setup;
    use serde_json::json;

    fn set(path: &str, value: Value) -> PatchOp {
        PatchOp::Add {
            path: path.to_string(),
            value,
        }
    }

    /// Root plus a linear chain `1/0/0 .. 1/0/(n-1)`, each adding one key.
    async fn linear_chain(store: &LocalStore, n: i64) -> Vec<Patch> {
        store.put_patch(&Patch::root()).await.unwrap();
        let mut parent = PatchKey::ROOT;
        let mut out = Vec::new();
        for i in 0..n {
            let key = PatchKey::new(1, 0, i);
            let ops = if i == 0 {
                vec![PatchOp::Replace {
                    path: "/data".into(),
                    value: json!({}),
                }]
            } else {
                vec![set(&format!("/data/k{}", i), json!(i))]
            };
            let patch = Patch::new(key, parent, ops);
            store.put_patch(&patch).await.unwrap();
            parent = key;
            out.push(patch);
        }
        out
    }

    #[tokio::test]
    async fn test_root_without_ops_yields_empty_document() {
        let ctx = setup().await;
        let store = &ctx.store;

        store
            .put_patch(&Patch::new(PatchKey::ROOT, PatchKey::ROOT, vec![]))
            .await
            .unwrap();

        let plan = store.get_patches_for_local_head(PatchKey::ROOT).await.unwrap();
        assert_eq!(plan.snapshot, json!({}));
        assert!(plan.ops.is_empty());
        assert_eq!(plan.depth, 1);
    }

    #[tokio::test]
    async fn test_seeded_root_yields_its_ops() {
        let ctx = setup().await;
        let store = &ctx.store;

        store.put_patch(&Patch::root()).await.unwrap();

        let plan = store.get_patches_for_local_head(PatchKey::ROOT).await.unwrap();
        assert_eq!(plan.snapshot, json!({}));
        assert_eq!(plan.ops, Patch::root().ops);
        assert_eq!(
            store.materialize(PatchKey::ROOT, 0).await.unwrap(),
            json!({ "data": null })
        );
    }

    #[tokio::test]
    async fn test_ops_replayed_oldest_first() {
        let ctx = setup().await;
        let store = &ctx.store;

        store.put_patch(&Patch::root()).await.unwrap();
        let a = Patch::new(
            PatchKey::new(1, 0, 0),
            PatchKey::ROOT,
            vec![PatchOp::Replace {
                path: "/data".into(),
                value: json!({ "x": 1 }),
            }],
        );
        // Only valid after `a`
        let b = Patch::new(
            PatchKey::new(1, 0, 1),
            a.patch_key,
            vec![PatchOp::Remove {
                path: "/data/x".into(),
            }],
        );
        store.put_patch(&a).await.unwrap();
        store.put_patch(&b).await.unwrap();

        let plan = store.get_patches_for_local_head(b.patch_key).await.unwrap();
        assert_eq!(plan.depth, 3);
        assert_eq!(plan.ops.last(), b.ops.last());
        assert_eq!(
            store.materialize(b.patch_key, 0).await.unwrap(),
            json!({ "data": {} })
        );
    }

    #[tokio::test]
    async fn test_snapshot_replay_matches_full_replay() {
        let ctx = setup().await;
        let store = &ctx.store;

        let chain = linear_chain(store, 8).await;
        let mid = chain[3].patch_key;
        let head = chain[7].patch_key;

        let full = store.materialize(head, 0).await.unwrap();

        let mid_doc = store.materialize(mid, 0).await.unwrap();
        store
            .put_snapshot(&Snapshot {
                patch_key: mid,
                snapshot: mid_doc,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let plan = store.get_patches_for_local_head(head).await.unwrap();
        assert_eq!(plan.depth, 4);
        assert_eq!(store.materialize(head, 0).await.unwrap(), full);
    }

    #[tokio::test]
    async fn test_materialize_stores_snapshot_past_interval() {
        let ctx = setup().await;
        let store = &ctx.store;

        let chain = linear_chain(store, 5).await;
        let head = chain[4].patch_key;

        store.materialize(chain[1].patch_key, 10).await.unwrap();
        assert!(store.get_snapshot(chain[1].patch_key).await.unwrap().is_none());

        let doc = store.materialize(head, 4).await.unwrap();
        let snapshot = store.get_snapshot(head).await.unwrap().unwrap();
        assert_eq!(snapshot.snapshot, doc);

        let plan = store.get_patches_for_local_head(head).await.unwrap();
        assert_eq!(plan.depth, 0);
        assert!(plan.ops.is_empty());
    }

    #[tokio::test]
    async fn test_missing_parent_is_not_found() {
        let ctx = setup().await;
        let store = &ctx.store;

        let orphan = Patch::new(PatchKey::new(2, 0, 1), PatchKey::new(2, 0, 0), vec![]);
        store.put_patch(&orphan).await.unwrap();

        let err = store
            .get_patches_for_local_head(orphan.patch_key)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(k) if k == PatchKey::new(2, 0, 0)));
    }

    #[tokio::test]
    async fn test_cycle_is_corrupt() {
        let ctx = setup().await;
        let store = &ctx.store;

        let a = PatchKey::new(1, 0, 0);
        let b = PatchKey::new(1, 0, 1);
        store.put_patch(&Patch::new(a, b, vec![])).await.unwrap();
        store.put_patch(&Patch::new(b, a, vec![])).await.unwrap();

        let err = store.get_patches_for_local_head(b).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_ancestors_and_branch() {
        let ctx = setup().await;
        let store = &ctx.store;

        let chain = linear_chain(store, 3).await;
        let side = Patch::new(PatchKey::new(2, 0, 0), chain[0].patch_key, vec![]);
        let side2 = Patch::new(PatchKey::new(2, 0, 1), side.patch_key, vec![]);
        store.put_patch(&side).await.unwrap();
        store.put_patch(&side2).await.unwrap();

        let ancestors = store.ancestors(chain[2].patch_key).await.unwrap();
        assert_eq!(ancestors.len(), 4);
        assert!(ancestors.contains(&PatchKey::ROOT));

        let branch = store
            .patches_since(side2.patch_key, &ancestors)
            .await
            .unwrap();
        assert_eq!(branch, vec![side, side2]);
    }
}
