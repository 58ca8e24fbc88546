//! Error types for the dispatch engine
//!
//! [`DispatchError`] is the typed rejection a caller can see from a send or a
//! draft mutation. [`WriteError`] is the per-recipient failure the writer
//! reports; it never escapes a dispatch on its own.

use thiserror::Error;

use crate::models::{BroadcastId, BroadcastStatus, UserId};

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Rejections raised by the broadcast store and the coordinator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Broadcast id is unknown
    #[error("Broadcast {id} not found")]
    NotFound { id: BroadcastId },

    /// Caller does not own the broadcast
    #[error("User {caller} does not own broadcast {id}")]
    Forbidden { id: BroadcastId, caller: UserId },

    /// Broadcast is not in a state that allows the operation
    #[error("Broadcast {id} is {status}, expected draft")]
    InvalidState {
        id: BroadcastId,
        status: BroadcastStatus,
    },

    /// Finalize was attempted with a lease that no longer owns the broadcast
    #[error("Lease for broadcast {id} is stale")]
    StaleLease { id: BroadcastId },

    /// Input rejected before touching storage
    #[error("Invalid input: {0}")]
    Validation(String),
}

impl DispatchError {
    pub fn not_found(id: BroadcastId) -> Self {
        Self::NotFound { id }
    }

    pub fn forbidden(id: BroadcastId, caller: UserId) -> Self {
        Self::Forbidden { id, caller }
    }

    pub fn invalid_state(id: BroadcastId, status: BroadcastStatus) -> Self {
        Self::InvalidState { id, status }
    }

    pub fn stale_lease(id: BroadcastId) -> Self {
        Self::StaleLease { id }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Conflicts and missing rows never succeed on retry.
    pub fn is_recoverable(&self) -> bool {
        false
    }

    /// Whether this rejection is meant for the end user
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::StaleLease { .. })
    }
}

/// Per-recipient write failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// Transient persistence error, retryable by the coordinator
    #[error("Failed to write notification for recipient {recipient}: {reason}")]
    WriteFailed { recipient: UserId, reason: String },
}

impl WriteError {
    pub fn write_failed(recipient: UserId, reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            recipient,
            reason: reason.into(),
        }
    }

    pub fn recipient(&self) -> UserId {
        match self {
            Self::WriteFailed { recipient, .. } => *recipient,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        true
    }
}
