//! Patchsync Server
//!
//! Stores every user's patch log and shared head, and fans new patches out to
//! the user's other clients.
//!
//! # Configuration
//!
//! Environment variables:
//! - `PATCHSYNC_PORT`: Port to listen on (default: 8080)
//! - `PATCHSYNC_SERVER_DB`: SQLite database path
//!   (default: ~/.local/share/patchsync-server/server.db)
//!
//! Requests authenticate with `Authorization: Bearer <id token>`, where the
//! token is the base64 JSON `{"user_id": N}`.

use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use patchsync::server::{router, AppState, ServerStorage};

/// Server configuration
#[derive(Debug, Clone)]
struct Config {
    /// Port to listen on
    port: u16,
    /// Path to the server database
    db_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("PATCHSYNC_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let db_path = std::env::var("PATCHSYNC_SERVER_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("patchsync-server")
                    .join("server.db")
            });

        Self { port, db_path }
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "patchsync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(Config::from_env()).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Database: {}", config.db_path.display());
    let storage = ServerStorage::open(&config.db_path).await?;

    let app = router(AppState { storage });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
