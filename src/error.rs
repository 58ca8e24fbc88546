//! Unified error handling for the herald crate
//!
//! This module provides a unified error type that consolidates the dispatch
//! rejections and the storage backend failures into a single `Error` enum,
//! while keeping the typed [`DispatchError`] reachable for callers that need
//! to tell a conflict from a missing row.
//!
//! # Architecture
//!
//! - [`HeraldErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use herald::error::{Error, HeraldErrorTrait};
//! use herald::dispatch::DispatchError;
//!
//! fn handle_error(err: Error) {
//!     match err.as_dispatch() {
//!         Some(DispatchError::InvalidState { .. }) => println!("already sent"),
//!         _ if err.is_recoverable() => println!("try again later"),
//!         _ => eprintln!("fatal: {err}"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::dispatch::error::{DispatchError, WriteError};

/// Common trait for all herald error types
pub trait HeraldErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Broadcast state and ownership rejections
    Dispatch,
    /// Per-recipient notification write failures
    Delivery,
    /// Storage and I/O errors
    Storage,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Delivery => "delivery",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unified error type for the herald crate
#[derive(Error, Debug)]
pub enum Error {
    /// Typed rejection from the store or coordinator
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Notification write failure that escaped the retry loop
    #[error(transparent)]
    Write(#[from] WriteError),

    /// SQLite errors
    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// PostgreSQL errors
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// PostgreSQL connection pool errors
    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl HeraldErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Dispatch(e) => e.is_recoverable(),
            Self::Write(e) => e.is_recoverable(),
            Self::Database(_) => false,
            Self::Postgres(_) => true, // connection resets are transient
            Self::Pool(_) => true,
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Dispatch(DispatchError::Validation(_)) => ErrorCategory::Config,
            Self::Dispatch(_) => ErrorCategory::Dispatch,
            Self::Write(_) => ErrorCategory::Delivery,
            Self::Database(_) | Self::Postgres(_) | Self::Pool(_) | Self::Io(_) => {
                ErrorCategory::Storage
            }
            Self::Json(_) => ErrorCategory::Storage,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Borrow the typed dispatch rejection, if this is one
    pub fn as_dispatch(&self) -> Option<&DispatchError> {
        match self {
            Self::Dispatch(e) => Some(e),
            _ => None,
        }
    }
}

// Conversion from rusqlite::Error
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err)
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
