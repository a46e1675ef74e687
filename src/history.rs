//! Bounded undo/redo over materialized document states.

use serde_json::Value;
use std::collections::VecDeque;

use crate::ops::{self, OpError, PatchOp};

/// Default number of states kept by [`Tracked`].
pub const DEFAULT_MAX_LEN: usize = 256;

/// A linear undo buffer with a cursor.
///
/// Only `[0, capacity)` holds reachable states; pushing after an undo
/// discards the redo branch.
#[derive(Debug, Clone)]
pub struct History<T> {
    buf: VecDeque<T>,
    i: usize,
    max_len: usize,
}

impl<T: Clone + PartialEq> History<T> {
    pub fn new(initial: T) -> Self {
        Self::with_max_len(initial, DEFAULT_MAX_LEN)
    }

    /// A buffer keeping at most `max_len` states (at least one).
    pub fn with_max_len(initial: T, max_len: usize) -> Self {
        let mut buf = VecDeque::new();
        buf.push_back(initial);
        Self {
            buf,
            i: 0,
            max_len: max_len.max(1),
        }
    }

    /// The state under the cursor.
    pub fn value(&self) -> &T {
        &self.buf[self.i]
    }

    pub fn push(&mut self, v: T) {
        if *self.value() == v {
            return;
        }
        self.i += 1;
        self.buf.truncate(self.i);
        self.buf.push_back(v);
        if self.buf.len() > self.max_len {
            self.buf.pop_front();
            self.i -= 1;
        }
    }

    pub fn undo(&mut self) -> &T {
        self.i = self.i.saturating_sub(1);
        self.value()
    }

    pub fn redo(&mut self) -> &T {
        if self.i + 1 < self.capacity() {
            self.i += 1;
        }
        self.value()
    }

    /// The state [`undo`](Self::undo) would return, without moving.
    pub fn peek_undo(&self) -> &T {
        &self.buf[self.i.saturating_sub(1)]
    }

    /// The state [`redo`](Self::redo) would return, without moving.
    pub fn peek_redo(&self) -> &T {
        if self.can_redo() {
            &self.buf[self.i + 1]
        } else {
            self.value()
        }
    }

    pub fn cursor(&self) -> usize {
        self.i
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn can_undo(&self) -> bool {
        self.i > 0
    }

    pub fn can_redo(&self) -> bool {
        self.i + 1 < self.capacity()
    }
}

/// A document together with its undo history.
///
/// Two flags track what has not been consumed yet: `history_pending` is
/// cleared by [`checkpoint`](Tracked::checkpoint), `remote_pending` by
/// [`take_remote_pending`](Tracked::take_remote_pending), which also hands
/// out every operation applied since the previous take.
#[derive(Debug, Clone)]
pub struct Tracked {
    doc: Value,
    history: History<Value>,
    history_pending: bool,
    remote_pending: bool,
    journal: Vec<PatchOp>,
}

impl Tracked {
    pub fn new(doc: Value) -> Self {
        Self::with_max_len(doc, DEFAULT_MAX_LEN)
    }

    pub fn with_max_len(doc: Value, max_len: usize) -> Self {
        Self {
            history: History::with_max_len(doc.clone(), max_len),
            doc,
            history_pending: false,
            remote_pending: false,
            journal: Vec::new(),
        }
    }

    pub fn doc(&self) -> &Value {
        &self.doc
    }

    pub fn history(&self) -> &History<Value> {
        &self.history
    }

    pub fn is_history_pending(&self) -> bool {
        self.history_pending
    }

    pub fn is_remote_pending(&self) -> bool {
        self.remote_pending
    }

    /// Applies `ops` to the document. On error the document is unchanged.
    pub fn apply(&mut self, ops: &[PatchOp]) -> Result<(), OpError> {
        let doc = ops::apply(self.doc.clone(), ops)?;
        self.install(doc, ops);
        Ok(())
    }

    /// Like [`apply`](Self::apply) when the caller already computed `doc`
    /// by applying `ops` to the current document.
    pub fn install(&mut self, doc: Value, ops: &[PatchOp]) {
        self.doc = doc;
        self.journal.extend_from_slice(ops);
        self.history_pending = true;
        self.remote_pending = true;
    }

    /// Records the current document in the history if it changed since the
    /// last checkpoint.
    pub fn checkpoint(&mut self) -> bool {
        if !self.history_pending {
            return false;
        }
        self.history.push(self.doc.clone());
        self.history_pending = false;
        true
    }

    pub fn undo(&mut self) -> bool {
        self.checkpoint();
        let target = self.history.undo().clone();
        self.transition(target)
    }

    pub fn redo(&mut self) -> bool {
        self.checkpoint();
        let target = self.history.redo().clone();
        self.transition(target)
    }

    /// The document [`undo`](Self::undo) would move to, or `None` if it
    /// would not move.
    pub fn undo_target(&self) -> Option<&Value> {
        let target = if self.has_unsaved_state() {
            if self.history.max_len == 1 {
                return None;
            }
            self.history.value()
        } else {
            self.history.peek_undo()
        };
        (*target != self.doc).then_some(target)
    }

    /// The document [`redo`](Self::redo) would move to, or `None` if it
    /// would not move.
    pub fn redo_target(&self) -> Option<&Value> {
        // A checkpoint would truncate the redo branch.
        if self.has_unsaved_state() {
            return None;
        }
        let target = self.history.peek_redo();
        (*target != self.doc).then_some(target)
    }

    fn has_unsaved_state(&self) -> bool {
        self.history_pending && *self.history.value() != self.doc
    }

    /// Operations applied since the last take, if any.
    pub fn take_remote_pending(&mut self) -> Option<Vec<PatchOp>> {
        if !self.remote_pending {
            return None;
        }
        self.remote_pending = false;
        Some(std::mem::take(&mut self.journal))
    }

    /// Replaces the document and starts a fresh history, e.g. after
    /// switching to another head.
    pub fn reset(&mut self, doc: Value) {
        *self = Self::with_max_len(doc, self.history.max_len);
    }

    fn transition(&mut self, target: Value) -> bool {
        if target == self.doc {
            return false;
        }
        self.journal.extend(ops::diff(&self.doc, &target));
        self.doc = target;
        self.remote_pending = true;
        true
    }
}
