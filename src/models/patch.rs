use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::patch_key::PatchKey;
use crate::ops::PatchOp;

/// One immutable step in a document's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub patch_key: PatchKey,
    pub parent_patch_key: PatchKey,
    pub created_at: DateTime<Utc>,
    pub ops: Vec<PatchOp>,
}

impl Patch {
    pub fn new(patch_key: PatchKey, parent_patch_key: PatchKey, ops: Vec<PatchOp>) -> Self {
        Self {
            patch_key,
            parent_patch_key,
            created_at: Utc::now(),
            ops,
        }
    }

    /// The seeded root every user's history starts from.
    pub fn root() -> Self {
        Self::new(
            PatchKey::ROOT,
            PatchKey::ROOT,
            vec![PatchOp::Replace {
                path: String::new(),
                value: serde_json::json!({ "data": null }),
            }],
        )
    }

    /// A root patch is its own parent.
    pub fn is_root(&self) -> bool {
        self.patch_key == self.parent_patch_key
    }
}

/// A fully materialized document at `patch_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub patch_key: PatchKey,
    pub snapshot: Value,
    pub created_at: DateTime<Utc>,
}

/// The two head pointers a local store keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadName {
    Local,
    Remote,
}

impl HeadName {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeadName::Local => "local",
            HeadName::Remote => "remote",
        }
    }
}

impl fmt::Display for HeadName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HeadName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(HeadName::Local),
            "remote" => Ok(HeadName::Remote),
            _ => Err(format!(
                "Invalid head '{}'. Valid options: local, remote",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_patch() {
        let root = Patch::root();
        assert!(root.is_root());
        assert!(root.patch_key.is_root());
        assert_eq!(root.ops.len(), 1);
    }

    #[test]
    fn test_child_is_not_root() {
        let p = Patch::new(PatchKey::new(1, 1, 0), PatchKey::ROOT, vec![]);
        assert!(!p.is_root());
    }

    #[test]
    fn test_patch_json_roundtrip_keeps_ops() {
        let p = Patch::new(
            PatchKey::new(1, 1, 0),
            PatchKey::ROOT,
            vec![PatchOp::Add {
                path: "/a".into(),
                value: serde_json::json!(1),
            }],
        );
        let json = serde_json::to_string(&p).unwrap();
        let parsed: Patch = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, p);
    }

    #[test]
    fn test_head_name_from_str() {
        assert_eq!(HeadName::from_str("local").unwrap(), HeadName::Local);
        assert_eq!(HeadName::from_str("remote").unwrap(), HeadName::Remote);
        assert!(HeadName::from_str("upstream").is_err());
        assert_eq!(HeadName::Remote.to_string(), "remote");
    }
}
