use clap::{Args, Subcommand};

use patchsync::config::Config;

use super::open_store;

/// Track which calendar entries are expanded in the UI
#[derive(Args)]
pub struct OpenCommand {
    #[command(subcommand)]
    command: OpenSubcommand,
}

#[derive(Subcommand)]
enum OpenSubcommand {
    /// List open entries
    List,
    /// Mark an entry open
    Add { id: String },
    /// Mark an entry closed
    Remove { id: String },
}

impl OpenCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let store = open_store(config).await?;
        match &self.command {
            OpenSubcommand::List => {
                let ids = store.ui_open_set_list().await?;
                if ids.is_empty() {
                    println!("No open entries.");
                }
                for id in ids {
                    println!("{}", id);
                }
            }
            OpenSubcommand::Add { id } => {
                store.ui_open_set_add(id).await?;
                println!("Opened {}", id);
            }
            OpenSubcommand::Remove { id } => {
                if store.ui_open_set_remove(id).await? {
                    println!("Closed {}", id);
                } else {
                    println!("{} was not open", id);
                }
            }
        }
        store.close().await;
        Ok(())
    }
}
