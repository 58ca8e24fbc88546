//! herald - Broadcast dispatch and notification fan-out
//!
//! Author a message once, then deliver it to a population of recipients with
//! single-flight per broadcast, bounded parallel fan-out, idempotent
//! per-recipient writes, and an accurate sent/failed tally.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`dispatch`] - Dispatch coordinator and recipient resolver
//! - [`storage`] - Broadcast, user and notification stores (SQLite, PostgreSQL, in-memory)
//! - [`models`] - Core data structures and types
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Retry with backoff and small helpers
//!
//! # Example
//!
//! ```no_run
//! use herald::config::Config;
//! use herald::dispatch::{Dispatcher, SendRequest};
//! use herald::models::{BroadcastId, UserId};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let storage = herald::storage::open(&config.database).await?;
//!     let dispatcher = Dispatcher::new(&storage, config.dispatch);
//!
//!     let result = dispatcher
//!         .send(SendRequest::new(BroadcastId(1), UserId(1)))
//!         .await?;
//!     println!("sent={} failed={}", result.sent_count, result.failed_count);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod models;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::dispatch::{DispatchContext, DispatchError, Dispatcher, SendRequest};
    pub use crate::error::{Error, ErrorCategory, HeraldErrorTrait, Result};
    pub use crate::models::{Broadcast, BroadcastId, BroadcastStatus, SendResult, UserId};
    pub use crate::storage::{
        BroadcastStore, NotificationReader, NotificationWriter, SharedStorage, UserDirectory,
    };
}

// Direct re-exports for convenience
pub use models::{Broadcast, BroadcastId, BroadcastStatus, Notification, SendResult, UserId};
