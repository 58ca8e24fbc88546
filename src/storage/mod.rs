//! Persistence for broadcasts, users and delivery records
//!
//! The dispatch engine only sees the traits in [`repository`]. SQLite is the
//! default backend; PostgreSQL is selected with `database.backend = "postgres"`.

pub mod postgres;
pub mod repository;
pub mod sqlite;

use std::sync::Arc;

pub use postgres::PostgresStorage;
pub use repository::{
    BroadcastStore, DeliveryStatus, MockStorage, NotificationReader, NotificationWriter,
    UserDirectory,
};
pub use sqlite::SqliteStorage;

use crate::config::{DatabaseConfig, StorageBackend};
use crate::error::Result;

/// One backend exposed through every storage trait
#[derive(Clone)]
pub struct SharedStorage {
    pub broadcasts: Arc<dyn BroadcastStore>,
    pub users: Arc<dyn UserDirectory>,
    pub writer: Arc<dyn NotificationWriter>,
    pub reader: Arc<dyn NotificationReader>,
}

impl SharedStorage {
    /// Share a single backend across all four roles
    pub fn from_backend<T>(backend: Arc<T>) -> Self
    where
        T: BroadcastStore + UserDirectory + NotificationWriter + NotificationReader + 'static,
    {
        Self {
            broadcasts: backend.clone(),
            users: backend.clone(),
            writer: backend.clone(),
            reader: backend,
        }
    }
}

/// Open the configured backend, creating its schema if needed
pub async fn open(config: &DatabaseConfig) -> Result<SharedStorage> {
    match config.backend {
        StorageBackend::Sqlite => {
            let storage = SqliteStorage::new(&config.sqlite_path)?;
            Ok(SharedStorage::from_backend(Arc::new(storage)))
        }
        StorageBackend::Postgres => {
            let storage = PostgresStorage::connect(config).await?;
            storage.init_schema().await?;
            Ok(SharedStorage::from_backend(Arc::new(storage)))
        }
    }
}
