pub mod broadcast;
pub mod inbox;
pub mod send;
pub mod user;

use anyhow::{Context, Result};

use herald::config::Config;
use herald::storage::{self, SharedStorage};

// Re-export command functions for convenience
pub use broadcast::{broadcast, BroadcastCommand};
pub use inbox::{inbox, read};
pub use send::{reap, send, SendParams};
pub use user::{user, UserCommand};

/// Open the configured backend
pub async fn open_storage(config: &Config) -> Result<SharedStorage> {
    storage::open(&config.database)
        .await
        .with_context(|| format!("Failed to open {} storage", config.database.backend.as_str()))
}

pub async fn init(config: &Config) -> Result<()> {
    open_storage(config).await?;

    println!("Schema ready");
    println!("  Backend: {}", config.database.backend.as_str());
    match config.database.backend {
        herald::config::StorageBackend::Sqlite => {
            println!("  Path: {}", config.database.sqlite_path.display());
        }
        herald::config::StorageBackend::Postgres => {
            println!("  Pool size: {}", config.database.pool_size);
        }
    }
    Ok(())
}
