//! JSON bodies exchanged with the remote service, shared by the HTTP client
//! and the server handlers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Patch, PatchKey};

/// Largest page the server returns from the pending-patches endpoint.
pub const MAX_PENDING_LIMIT: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserResponse {
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClientRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClientResponse {
    pub client_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePatchesRequest {
    pub patches: Vec<Patch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePatchesResponse {
    /// Number of patches that were not stored before.
    pub inserted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPendingPatchesResponse {
    pub patches: Vec<Patch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePendingPatchesRequest {
    pub patch_keys: Vec<PatchKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePendingPatchesResponse {
    pub deleted: u64,
}

/// The server's head, flattened with the producing client's name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadResponse {
    pub client_id: i64,
    pub session_id: i64,
    pub patch_id: i64,
    pub created_at: DateTime<Utc>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateHeadRequest {
    pub patch_key: PatchKey,
    /// Expected current head; the update is unconditional when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_if_match: Option<PatchKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateHeadResponse {
    pub updated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Remote head as seen by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteHead {
    pub patch_key: PatchKey,
    pub created_at: DateTime<Utc>,
    /// Name of the client that produced the head patch.
    pub name: String,
}

impl From<HeadResponse> for RemoteHead {
    fn from(h: HeadResponse) -> Self {
        Self {
            patch_key: PatchKey::new(h.client_id, h.session_id, h.patch_id),
            created_at: h.created_at,
            name: h.name,
        }
    }
}

/// Bearer token identifying a user: base64 of `{"user_id": N}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdToken {
    pub user_id: i64,
}

impl IdToken {
    pub fn new(user_id: i64) -> Self {
        Self { user_id }
    }

    pub fn to_bearer(&self) -> String {
        let json = serde_json::json!({ "user_id": self.user_id }).to_string();
        STANDARD.encode(json)
    }

    pub fn from_bearer(token: &str) -> Option<Self> {
        let bytes = STANDARD.decode(token.trim()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_token_roundtrip() {
        let token = IdToken::new(42);
        let bearer = token.to_bearer();
        assert_eq!(IdToken::from_bearer(&bearer), Some(token));
    }

    #[test]
    fn test_id_token_decodes_plain_json() {
        let bearer = STANDARD.encode(r#"{"user_id":7}"#);
        assert_eq!(IdToken::from_bearer(&bearer), Some(IdToken::new(7)));
    }

    #[test]
    fn test_id_token_rejects_garbage() {
        assert_eq!(IdToken::from_bearer("not base64!"), None);
        assert_eq!(IdToken::from_bearer(&STANDARD.encode("{}")), None);
    }

    #[test]
    fn test_update_head_request_omits_missing_precondition() {
        let req = UpdateHeadRequest {
            patch_key: PatchKey::new(1, 2, 3),
            header_if_match: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("header_if_match").is_none());

        let parsed: UpdateHeadRequest =
            serde_json::from_str(r#"{"patch_key":{"client_id":1,"session_id":2,"patch_id":3}}"#)
                .unwrap();
        assert_eq!(parsed.header_if_match, None);
    }

    #[test]
    fn test_head_response_into_remote_head() {
        let head: RemoteHead = HeadResponse {
            client_id: 4,
            session_id: 5,
            patch_id: 6,
            created_at: Utc::now(),
            name: "laptop".into(),
        }
        .into();
        assert_eq!(head.patch_key, PatchKey::new(4, 5, 6));
        assert_eq!(head.name, "laptop");
    }
}
