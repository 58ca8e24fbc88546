// Core data structures for herald

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// User identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Broadcast identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BroadcastId(pub i64);

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for BroadcastId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Opaque token proving which dispatch attempt owns a broadcast in `sending`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    /// Issue a fresh random token
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broadcast lifecycle status
///
/// `draft -> sending -> {sent | failed}`. `sent` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastStatus {
    Draft,
    Sending,
    Sent,
    Failed,
}

impl BroadcastStatus {
    /// Get string representation (also the stored column value)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    /// Parse a stored status value
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }

    /// Get all statuses
    pub fn all() -> Vec<Self> {
        vec![Self::Draft, Self::Sending, Self::Sent, Self::Failed]
    }
}

impl fmt::Display for BroadcastStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An authored message and its lifecycle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    pub id: BroadcastId,
    pub owner_id: UserId,
    pub title: String,
    pub body: String,
    pub status: BroadcastStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl Broadcast {
    pub fn is_owned_by(&self, user: UserId) -> bool {
        self.owner_id == user
    }
}

/// Partial update of a draft broadcast
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BroadcastUpdate {
    pub title: Option<String>,
    pub body: Option<String>,
}

impl BroadcastUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.body.is_none()
    }
}

/// Per-recipient delivery record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub broadcast_id: BroadcastId,
    pub recipient_id: UserId,
    pub delivered_at: DateTime<Utc>,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
}

/// A member of the recipient population
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Listing filter for an owner's broadcasts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastFilter {
    pub status: Option<BroadcastStatus>,
    pub page: u32,
    pub per_page: u32,
}

impl BroadcastFilter {
    pub const DEFAULT_PER_PAGE: u32 = 10;
    pub const MAX_PER_PAGE: u32 = 100;

    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            status: None,
            page: page.max(1),
            per_page: per_page.clamp(1, Self::MAX_PER_PAGE),
        }
    }

    pub fn with_status(mut self, status: BroadcastStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Row offset of the first item on this page
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.per_page)
    }
}

impl Default for BroadcastFilter {
    fn default() -> Self {
        Self::new(1, Self::DEFAULT_PER_PAGE)
    }
}

/// One page of a listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Page<T> {
    /// Number of pages needed for `total` items
    pub fn pages(&self) -> u64 {
        if self.per_page == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.per_page))
    }
}

/// Outcome of one dispatch, returned to the caller and never stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub broadcast_id: BroadcastId,
    pub sent_count: usize,
    pub failed_count: usize,
    /// Ascending
    pub failed_recipient_ids: Vec<UserId>,
}

impl SendResult {
    pub fn total(&self) -> usize {
        self.sent_count + self.failed_count
    }
}

/// Aggregated counts handed to `finalize`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchOutcome {
    pub sent_count: usize,
    pub failed_count: usize,
}

impl DispatchOutcome {
    pub fn new(sent_count: usize, failed_count: usize) -> Self {
        Self {
            sent_count,
            failed_count,
        }
    }

    /// A broadcast is `sent` unless it had targets and none were reached.
    pub fn is_success(&self) -> bool {
        self.sent_count > 0 || self.failed_count == 0
    }

    /// Terminal status this outcome finalizes to
    pub fn final_status(&self) -> BroadcastStatus {
        if self.is_success() {
            BroadcastStatus::Sent
        } else {
            BroadcastStatus::Failed
        }
    }
}
