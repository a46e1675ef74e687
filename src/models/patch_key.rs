use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally unique identifier of a patch: the client that produced it, the
/// session within that client, and the patch sequence within the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatchKey {
    pub client_id: i64,
    pub session_id: i64,
    pub patch_id: i64,
}

impl PatchKey {
    /// Key of the seeded root patch.
    pub const ROOT: PatchKey = PatchKey {
        client_id: 0,
        session_id: 0,
        patch_id: 0,
    };

    pub fn new(client_id: i64, session_id: i64, patch_id: i64) -> Self {
        Self {
            client_id,
            session_id,
            patch_id,
        }
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl fmt::Display for PatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.client_id, self.session_id, self.patch_id)
    }
}

/// Identifies the writer a session mints patches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: i64,
    pub client_id: i64,
    pub session_id: i64,
}

impl SessionKey {
    pub fn patch_key(&self, patch_id: i64) -> PatchKey {
        PatchKey::new(self.client_id, self.session_id, patch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(PatchKey::new(3, 7, 12).to_string(), "3/7/12");
        assert_eq!(PatchKey::ROOT.to_string(), "0/0/0");
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let mut keys = vec![
            PatchKey::new(2, 0, 0),
            PatchKey::new(1, 2, 0),
            PatchKey::new(1, 1, 5),
            PatchKey::new(1, 1, 4),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                PatchKey::new(1, 1, 4),
                PatchKey::new(1, 1, 5),
                PatchKey::new(1, 2, 0),
                PatchKey::new(2, 0, 0),
            ]
        );
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(PatchKey::new(1, 2, 3)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "client_id": 1, "session_id": 2, "patch_id": 3 })
        );
    }
}
