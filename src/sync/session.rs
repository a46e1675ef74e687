//! A sync session: one (client, session) writer bound to a local store and a
//! remote service.
//!
//! The session journals local edits as patches, uploads them, downloads the
//! patches other clients produced and advances the shared head with a
//! conditional update. A head conflict is reported to the caller, who picks
//! [`Session::use_remote`], [`Session::use_local`] or
//! [`Session::rebase_onto`].

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use super::client::RemoteClient;
use super::error::SyncError;
use super::protocol::{RemoteHead, MAX_PENDING_LIMIT};
use crate::db::LocalStore;
use crate::history::Tracked;
use crate::models::{HeadName, Patch, PatchKey, SessionKey, Snapshot};
use crate::ops::{self, PatchOp};

/// Maximum number of patches uploaded per request.
pub const FLUSH_BATCH_SIZE: usize = 200;

const CLIENT_ID_KEY: &str = "client_id";
const SESSION_ID_KEY: &str = "session_id";

/// Tunables for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Name the client registers under on first run.
    pub client_name: String,
    /// Store a snapshot every this many local patches (0 disables).
    pub snapshot_interval: usize,
    /// Patches requested per pull.
    pub pull_limit: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_name: "patchsync".to_string(),
            snapshot_interval: 100,
            pull_limit: 100,
        }
    }
}

/// Outcome of a conditional head update.
#[derive(Debug, Clone, PartialEq)]
pub enum HeadUpdate {
    /// The server head now points at this key.
    Success(PatchKey),
    /// The server head had moved; this is where it is now.
    Conflict(RemoteHead),
}

impl HeadUpdate {
    pub fn is_conflict(&self) -> bool {
        matches!(self, HeadUpdate::Conflict(_))
    }
}

/// Result of one [`Session::pull`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullOutcome {
    /// Patches received in this call.
    pub fetched: usize,
    /// Keys stored locally, parents before children.
    pub applied: Vec<PatchKey>,
    /// Received patches that were already stored.
    pub duplicates: usize,
    /// Patches held back until their parent arrives.
    pub buffered: usize,
}

/// Result of [`Session::sync`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub flushed: usize,
    pub pulled: usize,
    pub head: HeadUpdate,
}

/// Comparison of the server head with the last acknowledged one.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteStatus {
    InSync,
    Diverged(RemoteHead),
}

/// An open sync session. Methods take `&mut self`, so network calls for a
/// session never overlap.
pub struct Session {
    store: LocalStore,
    remote: RemoteClient,
    key: SessionKey,
    options: SessionOptions,
    next_patch_id: i64,
    local_head: PatchKey,
    remote_head: PatchKey,
    /// Downloaded patches whose parent is not stored yet, keyed by that parent.
    orphans: HashMap<PatchKey, Vec<Patch>>,
    doc: Tracked,
}

impl Session {
    /// Opens a new session.
    ///
    /// On first use of `store` this registers a client with the remote,
    /// downloads the remote head's chain and points both heads at it.
    pub async fn open(
        store: LocalStore,
        remote: RemoteClient,
        options: SessionOptions,
    ) -> Result<Self, SyncError> {
        let client_id = match store.get_number(CLIENT_ID_KEY).await? {
            Some(id) => id,
            None => {
                let id = remote.create_client(&options.client_name).await?;
                store.put_number(CLIENT_ID_KEY, id).await?;
                id
            }
        };
        let session_id = store.increment_number(SESSION_ID_KEY).await?;
        let key = SessionKey {
            user_id: remote.user_id(),
            client_id,
            session_id,
        };

        let mut session = Self {
            store,
            remote,
            key,
            options,
            next_patch_id: 0,
            local_head: PatchKey::ROOT,
            remote_head: PatchKey::ROOT,
            orphans: HashMap::new(),
            doc: Tracked::new(ops::empty_document()),
        };

        let local = session.store.get_head(HeadName::Local).await?;
        let remote_head = session.store.get_head(HeadName::Remote).await?;
        match (local, remote_head) {
            (Some(local), Some(remote_head)) => {
                session.local_head = local;
                session.remote_head = remote_head;
            }
            _ => {
                let head = session.remote.get_head().await?;
                session.pull_until(head.patch_key).await?;
                session
                    .store
                    .put_heads(head.patch_key, head.patch_key)
                    .await?;
                session.local_head = head.patch_key;
                session.remote_head = head.patch_key;
                tracing::info!(head = %head.patch_key, "initialized heads from remote");
            }
        }

        session.reload_document().await?;
        tracing::info!(
            client_id,
            session_id,
            local_head = %session.local_head,
            remote_head = %session.remote_head,
            "opened session"
        );
        Ok(session)
    }

    /// Releases the local store.
    pub async fn close(self) {
        self.store.close().await;
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn local_head(&self) -> PatchKey {
        self.local_head
    }

    pub fn remote_head(&self) -> PatchKey {
        self.remote_head
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn remote(&self) -> &RemoteClient {
        &self.remote
    }

    /// The document at the local head.
    pub fn document(&self) -> &Value {
        self.doc.doc()
    }

    /// Downloaded patches still waiting for their parent.
    pub fn buffered(&self) -> usize {
        self.orphans.values().map(Vec::len).sum()
    }

    // ── Local edits ───────────────────────────────────────────────────────

    /// Applies `ops` to the local document and records them as a new patch
    /// on the local head. Invalid ops are rejected without touching the
    /// store. Empty `ops` record nothing. The document only changes once the
    /// patch is persisted.
    pub async fn commit(&mut self, ops: Vec<PatchOp>) -> Result<Option<Patch>, SyncError> {
        if ops.is_empty() {
            return Ok(None);
        }
        let doc = ops::apply(self.doc.doc().clone(), &ops)?;
        let patch = self.record(ops, &doc).await?;

        self.doc.install(doc, &patch.ops);
        self.doc.checkpoint();
        self.doc.take_remote_pending();
        Ok(Some(patch))
    }

    /// Steps the document back one state and records the change as a patch.
    pub async fn undo(&mut self) -> Result<Option<Patch>, SyncError> {
        let Some(target) = self.doc.undo_target().cloned() else {
            return Ok(None);
        };
        let ops = ops::diff(self.doc.doc(), &target);
        let patch = self.record(ops, &target).await?;

        self.doc.undo();
        self.doc.take_remote_pending();
        Ok(Some(patch))
    }

    pub async fn redo(&mut self) -> Result<Option<Patch>, SyncError> {
        let Some(target) = self.doc.redo_target().cloned() else {
            return Ok(None);
        };
        let ops = ops::diff(self.doc.doc(), &target);
        let patch = self.record(ops, &target).await?;

        self.doc.redo();
        self.doc.take_remote_pending();
        Ok(Some(patch))
    }

    /// Enqueues `ops` as the next patch on the local head. `doc` is the
    /// document the patch produces.
    async fn record(&mut self, ops: Vec<PatchOp>, doc: &Value) -> Result<Patch, SyncError> {
        let patch = Patch::new(self.key.patch_key(self.next_patch_id), self.local_head, ops);
        self.store.enqueue(&patch).await?;
        self.next_patch_id += 1;
        self.local_head = patch.patch_key;

        let interval = self.options.snapshot_interval as i64;
        if interval > 0 && self.next_patch_id % interval == 0 {
            let snapshot = Snapshot {
                patch_key: patch.patch_key,
                snapshot: doc.clone(),
                created_at: patch.created_at,
            };
            if let Err(e) = self.store.put_snapshot(&snapshot).await {
                tracing::warn!(key = %patch.patch_key, "failed to store snapshot: {}", e);
            }
        }

        tracing::debug!(key = %patch.patch_key, ops = patch.ops.len(), "committed patch");
        Ok(patch)
    }

    // ── Upload ────────────────────────────────────────────────────────────

    /// Uploads every queued patch in batches. A batch leaves the queue only
    /// after the server acknowledged it, so a failure keeps it queued.
    pub async fn flush(&mut self) -> Result<usize, SyncError> {
        let mut flushed = 0;
        loop {
            let batch = self.store.pending_patches(FLUSH_BATCH_SIZE).await?;
            if batch.is_empty() {
                break;
            }
            self.remote.create_patches(&batch).await?;

            let keys: Vec<PatchKey> = batch.iter().map(|p| p.patch_key).collect();
            self.store.remove_pending(&keys).await?;
            flushed += keys.len();
            tracing::debug!(count = keys.len(), "flushed batch");
        }
        Ok(flushed)
    }

    // ── Download ──────────────────────────────────────────────────────────

    /// Fetches up to `limit` patches produced by other clients and stores
    /// those whose parent is known. The rest are held until their parent
    /// arrives. Only stored (or already known) patches are acknowledged, so
    /// the server keeps redelivering the held ones.
    pub async fn pull(&mut self, limit: usize) -> Result<PullOutcome, SyncError> {
        let patches = self
            .remote
            .get_pending_patches(self.key.client_id, limit)
            .await?;

        let mut outcome = PullOutcome {
            fetched: patches.len(),
            ..PullOutcome::default()
        };
        let mut acknowledged = Vec::new();

        for patch in patches {
            let key = patch.patch_key;
            if self.store.has_patch(key).await? {
                outcome.duplicates += 1;
                acknowledged.push(key);
                continue;
            }

            if patch.is_root() || self.store.has_patch(patch.parent_patch_key).await? {
                self.store_with_descendants(patch, &mut outcome.applied)
                    .await?;
            } else {
                let waiting = self.orphans.entry(patch.parent_patch_key).or_default();
                if !waiting.iter().any(|p| p.patch_key == key) {
                    waiting.push(patch);
                }
            }
        }

        acknowledged.extend(outcome.applied.iter().copied());
        if !acknowledged.is_empty() {
            self.remote
                .delete_pending_patches(self.key.client_id, &acknowledged)
                .await?;
        }

        outcome.buffered = self.buffered();
        if outcome.buffered > 0 {
            tracing::debug!(buffered = outcome.buffered, "holding patches with unknown parents");
        }
        Ok(outcome)
    }

    async fn store_with_descendants(
        &mut self,
        patch: Patch,
        applied: &mut Vec<PatchKey>,
    ) -> Result<(), SyncError> {
        let mut ready = vec![patch];
        while let Some(patch) = ready.pop() {
            self.store.put_patch(&patch).await?;
            applied.push(patch.patch_key);
            if let Some(children) = self.orphans.remove(&patch.patch_key) {
                ready.extend(children);
            }
        }
        Ok(())
    }

    /// Pulls until the server has nothing new to deliver. Returns the number
    /// of patches stored.
    ///
    /// Held patches stay at the front of the server queue, so a full page of
    /// them is followed by a wider page that reaches past them.
    pub async fn pull_all(&mut self) -> Result<usize, SyncError> {
        let mut limit = self.options.pull_limit.clamp(1, MAX_PENDING_LIMIT);
        let mut total = 0;
        loop {
            let outcome = self.pull(limit).await?;
            total += outcome.applied.len();
            if outcome.fetched < limit {
                break;
            }

            let progressed = !outcome.applied.is_empty() || outcome.duplicates > 0;
            if !progressed {
                let wider = (outcome.buffered + self.options.pull_limit).min(MAX_PENDING_LIMIT);
                if wider <= limit {
                    tracing::warn!(
                        buffered = outcome.buffered,
                        "pending queue is blocked by patches with unknown parents"
                    );
                    break;
                }
                limit = wider;
            }
        }
        Ok(total)
    }

    async fn pull_until(&mut self, head: PatchKey) -> Result<(), SyncError> {
        self.pull_all().await?;
        if !self.store.has_patch(head).await? {
            return Err(SyncError::MissingRemoteChain(head));
        }
        Ok(())
    }

    // ── Heads ─────────────────────────────────────────────────────────────

    /// Moves the server head to `new_head` if it still equals `expected`.
    pub async fn update_head(
        &mut self,
        new_head: PatchKey,
        expected: Option<PatchKey>,
    ) -> Result<HeadUpdate, SyncError> {
        if self.remote.update_head(new_head, expected).await? {
            self.store.put_head(HeadName::Remote, new_head).await?;
            self.remote_head = new_head;
            return Ok(HeadUpdate::Success(new_head));
        }

        let current = self.remote.get_head().await?;
        tracing::info!(
            local = %new_head,
            remote = %current.patch_key,
            by = %current.name,
            "head conflict"
        );
        Ok(HeadUpdate::Conflict(current))
    }

    /// Publishes the local head, expecting the server to still be at the
    /// last acknowledged remote head.
    pub async fn push_head(&mut self) -> Result<HeadUpdate, SyncError> {
        self.update_head(self.local_head, Some(self.remote_head))
            .await
    }

    /// Flushes, publishes the local head and pulls what other clients wrote.
    pub async fn sync(&mut self) -> Result<SyncReport, SyncError> {
        let flushed = self.flush().await?;
        let head = self.push_head().await?;
        let pulled = self.pull_all().await?;
        Ok(SyncReport {
            flushed,
            pulled,
            head,
        })
    }

    pub async fn check_remote(&mut self) -> Result<RemoteStatus, SyncError> {
        let head = self.remote.get_head().await?;
        if head.patch_key == self.remote_head {
            Ok(RemoteStatus::InSync)
        } else {
            Ok(RemoteStatus::Diverged(head))
        }
    }

    // ── Conflict resolution ───────────────────────────────────────────────

    /// Abandons the local branch and moves both heads to `head`.
    pub async fn use_remote(&mut self, head: PatchKey) -> Result<(), SyncError> {
        self.pull_until(head).await?;
        self.store.put_heads(head, head).await?;
        self.local_head = head;
        self.remote_head = head;
        self.reload_document().await?;
        tracing::info!(%head, "switched to remote head");
        Ok(())
    }

    /// Overwrites the server head with the local head unconditionally.
    pub async fn use_local(&mut self) -> Result<HeadUpdate, SyncError> {
        self.flush().await?;
        let update = self.update_head(self.local_head, None).await?;
        tracing::info!(head = %self.local_head, "forced local head");
        Ok(update)
    }

    /// Re-applies the local patches not reachable from `onto` as new patches
    /// on top of it. Returns the new patches; the caller retries the head
    /// update afterwards. The replaced patches leave the upload queue; the
    /// ones already uploaded stay on the server. If a local patch no longer
    /// applies nothing is changed and the error is returned.
    pub async fn rebase_onto(&mut self, onto: PatchKey) -> Result<Vec<Patch>, SyncError> {
        self.pull_until(onto).await?;
        let base: HashSet<PatchKey> = self.store.ancestors(onto).await?;
        let branch = self.store.patches_since(self.local_head, &base).await?;

        if branch.is_empty() {
            let doc = self
                .store
                .materialize(onto, self.options.snapshot_interval)
                .await?;
            self.store.put_head(HeadName::Local, onto).await?;
            self.local_head = onto;
            self.doc.reset(doc);
            tracing::info!(%onto, "fast-forwarded local head");
            return Ok(Vec::new());
        }

        let mut doc = self
            .store
            .materialize(onto, self.options.snapshot_interval)
            .await?;
        let mut parent = onto;
        let mut next_patch_id = self.next_patch_id;
        let mut rebased = Vec::with_capacity(branch.len());
        let superseded: Vec<PatchKey> = branch.iter().map(|p| p.patch_key).collect();

        for patch in branch {
            doc = ops::apply(doc, &patch.ops)?;
            let copy = Patch::new(self.key.patch_key(next_patch_id), parent, patch.ops);
            next_patch_id += 1;
            parent = copy.patch_key;
            rebased.push(copy);
        }

        self.store.enqueue_replacing(&rebased, &superseded).await?;
        self.next_patch_id = next_patch_id;
        self.local_head = parent;
        self.doc.reset(doc);

        tracing::info!(%onto, count = rebased.len(), head = %parent, "rebased local patches");
        Ok(rebased)
    }

    async fn reload_document(&mut self) -> Result<(), SyncError> {
        let doc = self
            .store
            .materialize(self.local_head, self.options.snapshot_interval)
            .await?;
        self.doc.reset(doc);
        Ok(())
    }
}
