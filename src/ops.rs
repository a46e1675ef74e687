//! Document mutation operations.
//!
//! Patches carry an ordered list of [`PatchOp`]s in RFC 6902 form. The
//! operation set is closed: anything that does not deserialize into one of
//! these variants is rejected before it reaches storage or the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A single JSON Patch operation. Paths are RFC 6901 JSON Pointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Remove { path }
            | PatchOp::Replace { path, .. }
            | PatchOp::Move { path, .. }
            | PatchOp::Copy { path, .. }
            | PatchOp::Test { path, .. } => path,
        }
    }
}

/// Errors raised while applying operations to a document.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OpError {
    #[error("invalid JSON pointer: {0:?}")]
    InvalidPointer(String),
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("invalid array index in {0}")]
    InvalidIndex(String),
    #[error("target of {0} is not a container")]
    InvalidTarget(String),
    #[error("cannot move {from} into its own child {path}")]
    MoveIntoChild { from: String, path: String },
    #[error("test failed at {0}")]
    TestFailed(String),
}

/// Parses a serialized operations string, e.g. a legacy `patch` column value.
pub fn parse_ops(s: &str) -> Result<Vec<PatchOp>, serde_json::Error> {
    serde_json::from_str(s)
}

/// Applies `ops` in order. The first failing operation aborts the whole
/// application.
pub fn apply(mut doc: Value, ops: &[PatchOp]) -> Result<Value, OpError> {
    for op in ops {
        apply_op(&mut doc, op)?;
    }
    Ok(doc)
}

/// Applies a single operation in place.
pub fn apply_op(doc: &mut Value, op: &PatchOp) -> Result<(), OpError> {
    match op {
        PatchOp::Add { path, value } => {
            apply_add(doc, path, &parse_pointer(path)?, value.clone())
        }
        PatchOp::Remove { path } => apply_remove(doc, path, &parse_pointer(path)?).map(|_| ()),
        PatchOp::Replace { path, value } => {
            apply_replace(doc, path, &parse_pointer(path)?, value.clone())
        }
        PatchOp::Copy { from, path } => {
            let src = get_at(doc, &parse_pointer(from)?)
                .ok_or_else(|| OpError::NotFound(from.clone()))?
                .clone();
            apply_add(doc, path, &parse_pointer(path)?, src)
        }
        PatchOp::Move { from, path } => {
            let from_tokens = parse_pointer(from)?;
            let to_tokens = parse_pointer(path)?;
            if to_tokens.len() > from_tokens.len() && to_tokens.starts_with(&from_tokens) {
                return Err(OpError::MoveIntoChild {
                    from: from.clone(),
                    path: path.clone(),
                });
            }
            let value = apply_remove(doc, from, &from_tokens)?;
            apply_add(doc, path, &to_tokens, value)
        }
        PatchOp::Test { path, value } => {
            let current =
                get_at(doc, &parse_pointer(path)?).ok_or_else(|| OpError::NotFound(path.clone()))?;
            if current == value {
                Ok(())
            } else {
                Err(OpError::TestFailed(path.clone()))
            }
        }
    }
}

/// Computes operations that turn `before` into `after`.
///
/// Objects are compared key by key; arrays and scalars that differ are
/// replaced whole.
pub fn diff(before: &Value, after: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_at("", before, after, &mut ops);
    ops
}

fn diff_at(path: &str, before: &Value, after: &Value, ops: &mut Vec<PatchOp>) {
    if before == after {
        return;
    }
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            for (key, bv) in b {
                let child = format!("{}/{}", path, escape_token(key));
                match a.get(key) {
                    Some(av) => diff_at(&child, bv, av, ops),
                    None => ops.push(PatchOp::Remove { path: child }),
                }
            }
            for (key, av) in a {
                if !b.contains_key(key) {
                    ops.push(PatchOp::Add {
                        path: format!("{}/{}", path, escape_token(key)),
                        value: av.clone(),
                    });
                }
            }
        }
        _ => ops.push(PatchOp::Replace {
            path: path.to_string(),
            value: after.clone(),
        }),
    }
}

// ── Pointer handling ──────────────────────────────────────────────────────

fn parse_pointer(pointer: &str) -> Result<Vec<String>, OpError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let rest = pointer
        .strip_prefix('/')
        .ok_or_else(|| OpError::InvalidPointer(pointer.to_string()))?;
    rest.split('/').map(|t| unescape_token(t, pointer)).collect()
}

fn unescape_token(token: &str, pointer: &str) -> Result<String, OpError> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                _ => return Err(OpError::InvalidPointer(pointer.to_string())),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn get_at<'a>(doc: &'a Value, tokens: &[String]) -> Option<&'a Value> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map.get(token)?,
            Value::Array(arr) => arr.get(token.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn get_mut_at<'a>(
    doc: &'a mut Value,
    tokens: &[String],
    path: &str,
) -> Result<&'a mut Value, OpError> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map.get_mut(token),
            Value::Array(arr) => match token.parse::<usize>() {
                Ok(idx) => arr.get_mut(idx),
                Err(_) => return Err(OpError::InvalidIndex(path.to_string())),
            },
            _ => None,
        }
        .ok_or_else(|| OpError::NotFound(path.to_string()))?;
    }
    Ok(current)
}

fn array_index(key: &str, path: &str) -> Result<usize, OpError> {
    // Leading zeros are not valid array indices.
    if key.len() > 1 && key.starts_with('0') {
        return Err(OpError::InvalidIndex(path.to_string()));
    }
    key.parse()
        .map_err(|_| OpError::InvalidIndex(path.to_string()))
}

// ── Individual operation applicators ──────────────────────────────────────

fn apply_add(doc: &mut Value, path: &str, tokens: &[String], value: Value) -> Result<(), OpError> {
    let Some((key, parent_tokens)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    match get_mut_at(doc, parent_tokens, path)? {
        Value::Object(map) => {
            map.insert(key.clone(), value);
            Ok(())
        }
        Value::Array(arr) => {
            if key == "-" {
                arr.push(value);
                return Ok(());
            }
            let idx = array_index(key, path)?;
            if idx > arr.len() {
                return Err(OpError::InvalidIndex(path.to_string()));
            }
            arr.insert(idx, value);
            Ok(())
        }
        _ => Err(OpError::InvalidTarget(path.to_string())),
    }
}

fn apply_remove(doc: &mut Value, path: &str, tokens: &[String]) -> Result<Value, OpError> {
    let Some((key, parent_tokens)) = tokens.split_last() else {
        return Err(OpError::InvalidTarget(path.to_string()));
    };
    match get_mut_at(doc, parent_tokens, path)? {
        Value::Object(map) => map
            .remove(key)
            .ok_or_else(|| OpError::NotFound(path.to_string())),
        Value::Array(arr) => {
            let idx = array_index(key, path)?;
            if idx >= arr.len() {
                return Err(OpError::NotFound(path.to_string()));
            }
            Ok(arr.remove(idx))
        }
        _ => Err(OpError::InvalidTarget(path.to_string())),
    }
}

fn apply_replace(
    doc: &mut Value,
    path: &str,
    tokens: &[String],
    value: Value,
) -> Result<(), OpError> {
    let Some((key, parent_tokens)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    match get_mut_at(doc, parent_tokens, path)? {
        Value::Object(map) => match map.get_mut(key) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(OpError::NotFound(path.to_string())),
        },
        Value::Array(arr) => {
            let idx = array_index(key, path)?;
            let slot = arr
                .get_mut(idx)
                .ok_or_else(|| OpError::NotFound(path.to_string()))?;
            *slot = value;
            Ok(())
        }
        _ => Err(OpError::InvalidTarget(path.to_string())),
    }
}

/// The document materialized before any patch has been applied.
pub fn empty_document() -> Value {
    Value::Object(Map::new())
}
