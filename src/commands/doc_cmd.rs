//! Document commands: inspect the materialized document and journal edits.

use clap::{Args, Subcommand};

use patchsync::config::Config;
use patchsync::models::HeadName;
use patchsync::ops;

use super::{open_session, open_store};

/// Inspect or edit the replicated document
#[derive(Args)]
pub struct DocCommand {
    #[command(subcommand)]
    command: DocSubcommand,
}

#[derive(Subcommand)]
enum DocSubcommand {
    /// Print the document at the local head
    Show,

    /// Apply a JSON Patch array to the document and record it
    Apply {
        /// Operations, e.g. '[{"op":"add","path":"/data/title","value":"x"}]'
        ops: String,

        /// Sync with the server after recording
        #[arg(long)]
        sync: bool,
    },

    /// Show heads and the number of unsent patches
    Log,
}

impl DocCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            DocSubcommand::Show => show(config).await,
            DocSubcommand::Apply { ops, sync } => apply(config, ops, *sync).await,
            DocSubcommand::Log => log(config).await,
        }
    }
}

async fn show(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(config).await?;
    let Some(head) = store.get_head(HeadName::Local).await? else {
        println!("No document yet. Run `patchsync sync` to fetch it.");
        return Ok(());
    };

    let doc = store
        .materialize(head, config.snapshot_interval.value)
        .await?;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    store.close().await;
    Ok(())
}

async fn apply(config: &Config, raw: &str, sync: bool) -> Result<(), Box<dyn std::error::Error>> {
    let ops = ops::parse_ops(raw)?;
    let mut session = open_session(config).await?;

    match session.commit(ops).await? {
        Some(patch) => println!("Recorded patch {}", patch.patch_key),
        None => println!("Nothing to record."),
    }

    if sync {
        let report = session.sync().await?;
        super::sync_cmd::print_report(&report);
    }

    session.close().await;
    Ok(())
}

async fn log(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(config).await?;
    let local = store.get_head(HeadName::Local).await?;
    let remote = store.get_head(HeadName::Remote).await?;
    let pending = store.pending_count().await?;

    println!("Store:       {}", store.path().display());
    println!("Schema:      v{}", store.version().await?);
    match local {
        Some(key) => println!("Local head:  {}", key),
        None => println!("Local head:  (none)"),
    }
    match remote {
        Some(key) => println!("Remote head: {}", key),
        None => println!("Remote head: (none)"),
    }
    println!("Unsent:      {}", pending);

    store.close().await;
    Ok(())
}
