//! Local-first patch replication.
//!
//! A document's history is an append-only chain of [`models::Patch`]es kept
//! in a versioned SQLite store ([`db::LocalStore`]). A [`sync::Session`]
//! journals local edits, uploads them, downloads other clients' patches and
//! advances the shared head with a conditional update against the remote
//! service in [`server`].

pub mod config;
pub mod db;
pub mod history;
pub mod models;
pub mod ops;
pub mod server;
pub mod sync;
