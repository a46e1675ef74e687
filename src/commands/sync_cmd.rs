//! Sync CLI commands for synchronizing with the server.

use clap::{Args, Subcommand, ValueEnum};

use patchsync::config::Config;
use patchsync::sync::{HeadUpdate, RemoteClient, RemoteStatus, SyncError, SyncReport};

use super::{open_session, open_store};

/// Sync with remote server
#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,
}

#[derive(Debug, Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration and server status
    Status,

    /// Create the configured user on the server
    Signup,

    /// Resolve a head conflict reported by a previous sync
    Resolve {
        #[arg(value_enum)]
        strategy: Strategy,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Strategy {
    /// Drop local patches the server never accepted and adopt its head
    Remote,
    /// Overwrite the server head with the local head
    Local,
    /// Re-apply local patches on top of the server head
    Rebase,
}

impl SyncCommand {
    pub async fn run(&self, config: &Config) -> Result<(), SyncError> {
        match &self.command {
            None => self.sync(config).await,
            Some(SyncSubcommand::Status) => self.status(config).await,
            Some(SyncSubcommand::Signup) => self.signup(config).await,
            Some(SyncSubcommand::Resolve { strategy }) => self.resolve(config, *strategy).await,
        }
    }

    async fn sync(&self, config: &Config) -> Result<(), SyncError> {
        let mut session = open_session(config).await?;

        println!("Syncing with server...");
        println!();

        let report = session.sync().await?;
        print_report(&report);

        session.close().await;
        Ok(())
    }

    async fn status(&self, config: &Config) -> Result<(), SyncError> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        let (Some(server_url), Some(user_id)) = (&config.sync.server_url, config.sync.user_id)
        else {
            println!("Status: Not configured");
            println!();
            println!("To enable sync, add to your config file:");
            println!();
            println!("  sync:");
            println!("    server_url: \"http://localhost:8080\"");
            println!("    user_id: 1");
            println!();
            println!("Or set environment variables:");
            println!("  PATCHSYNC_SYNC_URL");
            println!("  PATCHSYNC_USER_ID");
            return Ok(());
        };

        println!("Server:  {}", server_url);
        println!("User:    {}", user_id);

        let store = open_store(config).await?;
        println!("Unsent:  {}", store.pending_count().await?);
        store.close().await;
        println!();

        print!("Server status: ");
        let client = RemoteClient::from_config(&config.sync)?;
        match client.health().await {
            Ok(health) => println!("✓ connected (v{})", health.version),
            Err(e) if e.is_transient() => {
                println!("✗ unreachable");
                return Ok(());
            }
            Err(e) => {
                println!("✗ error: {}", e);
                return Ok(());
            }
        }

        let mut session = open_session(config).await?;
        match session.check_remote().await? {
            RemoteStatus::InSync => {
                println!("Head:          ✓ in sync at {}", session.remote_head())
            }
            RemoteStatus::Diverged(head) => println!(
                "Head:          ↻ server moved to {} (by {})",
                head.patch_key, head.name
            ),
        }
        session.close().await;
        Ok(())
    }

    async fn signup(&self, config: &Config) -> Result<(), SyncError> {
        let client = RemoteClient::from_config(&config.sync)?;
        if client.create_user().await? {
            println!("Created user {} on {}", client.user_id(), client.server_url());
        } else {
            println!("User {} already exists", client.user_id());
        }
        Ok(())
    }

    async fn resolve(&self, config: &Config, strategy: Strategy) -> Result<(), SyncError> {
        let mut session = open_session(config).await?;

        let head = match session.check_remote().await? {
            RemoteStatus::InSync => {
                println!("No conflict: server head is {}", session.remote_head());
                session.close().await;
                return Ok(());
            }
            RemoteStatus::Diverged(head) => head,
        };

        match strategy {
            Strategy::Remote => {
                session.use_remote(head.patch_key).await?;
                println!("Now at server head {}", head.patch_key);
            }
            Strategy::Local => {
                let update = session.use_local().await?;
                print_head(&update);
            }
            Strategy::Rebase => {
                let rebased = session.rebase_onto(head.patch_key).await?;
                println!(
                    "Rebased {} patch{} onto {}",
                    rebased.len(),
                    if rebased.len() == 1 { "" } else { "es" },
                    head.patch_key
                );
                session.flush().await?;
                let update = session
                    .update_head(session.local_head(), Some(head.patch_key))
                    .await?;
                session.pull_all().await?;
                print_head(&update);
            }
        }

        session.close().await;
        Ok(())
    }
}

pub(crate) fn print_report(report: &SyncReport) {
    println!(
        "  ✓ sent {} patch{}",
        report.flushed,
        if report.flushed == 1 { "" } else { "es" }
    );
    println!(
        "  ✓ received {} patch{}",
        report.pulled,
        if report.pulled == 1 { "" } else { "es" }
    );
    print_head(&report.head);
}

fn print_head(update: &HeadUpdate) {
    match update {
        HeadUpdate::Success(key) => {
            println!();
            println!("Sync complete. Head is {}.", key);
        }
        HeadUpdate::Conflict(head) => {
            println!();
            println!(
                "Conflict: server head moved to {} (by {}).",
                head.patch_key, head.name
            );
            println!("Run `patchsync sync resolve <remote|local|rebase>`.");
        }
    }
}
