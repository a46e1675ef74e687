mod config_cmd;
mod doc_cmd;
mod open_cmd;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use doc_cmd::DocCommand;
pub use open_cmd::OpenCommand;
pub use sync_cmd::SyncCommand;

use patchsync::config::Config;
use patchsync::db::LocalStore;
use patchsync::sync::{RemoteClient, Session, SyncError};

/// Opens the configured local store.
pub async fn open_store(config: &Config) -> Result<LocalStore, SyncError> {
    Ok(LocalStore::open(&config.database_path.value).await?)
}

/// Opens a session on the configured store and remote.
pub async fn open_session(config: &Config) -> Result<Session, SyncError> {
    let remote = RemoteClient::from_config(&config.sync)?;
    let store = open_store(config).await?;
    Session::open(store, remote, config.session_options()).await
}
