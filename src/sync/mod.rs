//! Replication against the remote patch service.
//!
//! [`RemoteClient`] speaks the HTTP/JSON protocol in [`protocol`];
//! [`Session`] drives it for one local writer.

pub mod client;
pub mod error;
pub mod protocol;
pub mod session;

pub use client::RemoteClient;
pub use error::SyncError;
pub use protocol::RemoteHead;
pub use session::{
    HeadUpdate, PullOutcome, RemoteStatus, Session, SessionOptions, SyncReport, FLUSH_BATCH_SIZE,
};
