//! Sync error types.

use thiserror::Error;

use crate::db::StoreError;
use crate::models::PatchKey;
use crate::ops::OpError;

/// Errors that can occur while talking to the remote service or applying
/// what it returned.
///
/// A head conflict is not an error; see [`HeadUpdate`](super::HeadUpdate).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync not configured. Add sync.server_url and sync.user_id to config.")]
    NotConfigured,

    /// The request did not complete; retrying later may succeed.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Invalid server response: {0}")]
    Decode(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Patch rejected: {0}")]
    Ops(#[from] OpError),

    /// The remote head's chain could not be downloaded completely.
    #[error("Remote chain for head {0} is incomplete")]
    MissingRemoteChain(PatchKey),
}

impl SyncError {
    /// Whether the same call may succeed when retried unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
