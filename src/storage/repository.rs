//! Repository Pattern for Database Abstraction
//!
//! This module provides trait-based repository abstractions to decouple
//! the dispatch engine from storage implementations, enabling:
//! - Easy testing with mock implementations
//! - Swappable storage backends (SQLite, PostgreSQL)
//! - Clear separation of concerns
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Dispatch Engine                         │
//! │              (Dispatcher, RecipientResolver)                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Repository Traits                         │
//! │  BroadcastStore, UserDirectory, NotificationWriter/Reader   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐ ┌─────────────────┐
//! │     SQLite      │ │   PostgreSQL    │ │      Mock       │
//! │  Implementation │ │ Implementation  │ │ Implementation  │
//! └─────────────────┘ └─────────────────┘ └─────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::dispatch::error::{DispatchError, WriteError};
use crate::error::{Error, Result};
use crate::models::{
    Broadcast, BroadcastFilter, BroadcastId, BroadcastStatus, BroadcastUpdate, DispatchOutcome,
    LeaseToken, Notification, Page, User, UserId,
};

// ============================================================================
// Core Types
// ============================================================================

/// Successful result of a notification write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    /// A new record was written
    Delivered,
    /// A record for the pair already existed; nothing was written
    AlreadyDelivered,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::AlreadyDelivered => "already_delivered",
        }
    }
}

// ============================================================================
// Repository Traits
// ============================================================================

/// Owner of broadcast records and their status transitions
#[async_trait]
pub trait BroadcastStore: Send + Sync {
    /// Create a broadcast in `draft`
    async fn create_draft(&self, owner: UserId, title: &str, body: &str) -> Result<Broadcast>;

    /// Get broadcast by ID
    async fn get(&self, id: BroadcastId) -> Result<Option<Broadcast>>;

    /// Get a broadcast the caller owns
    async fn get_owned(&self, id: BroadcastId, owner: UserId) -> Result<Broadcast> {
        let broadcast = self
            .get(id)
            .await?
            .ok_or_else(|| DispatchError::not_found(id))?;

        if !broadcast.is_owned_by(owner) {
            return Err(DispatchError::forbidden(id, owner).into());
        }

        Ok(broadcast)
    }

    /// List an owner's broadcasts, newest first
    async fn list_by_owner(&self, owner: UserId, filter: &BroadcastFilter)
        -> Result<Page<Broadcast>>;

    /// Edit title/body while still in `draft`
    async fn update_draft(
        &self,
        id: BroadcastId,
        owner: UserId,
        update: &BroadcastUpdate,
    ) -> Result<Broadcast>;

    /// Delete a broadcast while still in `draft`; cascades its notifications
    async fn delete_draft(&self, id: BroadcastId, owner: UserId) -> Result<()>;

    /// Atomically move `draft -> sending` and issue a lease.
    ///
    /// Exactly one concurrent caller per broadcast succeeds; the rest get
    /// `InvalidState`.
    async fn try_begin_send(&self, id: BroadcastId, owner: UserId) -> Result<LeaseToken>;

    /// Move `sending -> sent | failed` if `lease` still owns the broadcast.
    ///
    /// Repeating the call with the same lease after the transition is a no-op
    /// that reports the terminal status.
    async fn finalize(
        &self,
        id: BroadcastId,
        lease: LeaseToken,
        outcome: DispatchOutcome,
    ) -> Result<BroadcastStatus>;

    /// Fail every broadcast stuck in `sending` for longer than `older_than`
    async fn expire_stale_leases(&self, older_than: Duration) -> Result<Vec<BroadcastId>>;
}

/// Read side of the user population
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Register a user; username and email must be unique
    async fn create_user(&self, username: &str, email: &str) -> Result<User>;

    /// Mark a user inactive; returns whether anything changed
    async fn deactivate_user(&self, id: UserId) -> Result<bool>;

    /// All users, ascending id
    async fn list_users(&self) -> Result<Vec<User>>;

    /// Active user ids, ascending
    async fn active_user_ids(&self) -> Result<Vec<UserId>>;

    /// The subset of `ids` that exist and are active
    async fn known_user_ids(&self, ids: &[UserId]) -> Result<BTreeSet<UserId>>;
}

/// Persists one delivery record per (broadcast, recipient) pair
#[async_trait]
pub trait NotificationWriter: Send + Sync {
    /// Idempotent: an existing record yields `AlreadyDelivered`
    async fn deliver(
        &self,
        broadcast_id: BroadcastId,
        recipient_id: UserId,
    ) -> std::result::Result<DeliveryStatus, WriteError>;
}

/// Inbox queries over delivery records
#[async_trait]
pub trait NotificationReader: Send + Sync {
    /// Records of one broadcast, ascending recipient id
    async fn list_for_broadcast(&self, broadcast_id: BroadcastId) -> Result<Vec<Notification>>;

    /// A recipient's inbox, newest first
    async fn list_for_recipient(
        &self,
        recipient_id: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<Page<Notification>>;

    /// Mark a record read. Only its recipient may do so; returns whether a row changed.
    async fn mark_read(&self, notification_id: i64, recipient_id: UserId) -> Result<bool>;
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Trim and check draft fields
pub(crate) fn validate_draft(title: &str, body: &str) -> Result<(String, String)> {
    let title = title.trim();
    let body = body.trim();

    if title.is_empty() {
        return Err(DispatchError::validation("title must not be empty").into());
    }
    if body.is_empty() {
        return Err(DispatchError::validation("body must not be empty").into());
    }

    Ok((title.to_string(), body.to_string()))
}

/// Apply an update on top of the current draft fields
pub(crate) fn merge_update(current: &Broadcast, update: &BroadcastUpdate) -> Result<(String, String)> {
    let title = update.title.as_deref().unwrap_or(&current.title);
    let body = update.body.as_deref().unwrap_or(&current.body);
    validate_draft(title, body)
}

pub(crate) fn validate_user(username: &str, email: &str) -> Result<(String, String)> {
    let username = username.trim();
    let email = email.trim();

    if username.is_empty() {
        return Err(DispatchError::validation("username must not be empty").into());
    }
    if !email.contains('@') {
        return Err(DispatchError::validation(format!("invalid email: {email}")).into());
    }

    Ok((username.to_string(), email.to_string()))
}

/// Explain why a conditional `draft -> sending` update matched no row
pub(crate) fn reject_begin(
    id: BroadcastId,
    caller: UserId,
    current: Option<(UserId, BroadcastStatus)>,
) -> DispatchError {
    match current {
        None => DispatchError::not_found(id),
        Some((owner, _)) if owner != caller => DispatchError::forbidden(id, caller),
        Some((_, status)) => DispatchError::invalid_state(id, status),
    }
}

/// Explain why a conditional `sending -> terminal` update matched no row
pub(crate) fn resolve_finalize_miss(
    id: BroadcastId,
    lease: LeaseToken,
    current: Option<(BroadcastStatus, Option<LeaseToken>)>,
) -> Result<BroadcastStatus> {
    match current {
        None => Err(DispatchError::not_found(id).into()),
        Some((_, held)) if held != Some(lease) => Err(DispatchError::stale_lease(id).into()),
        Some((status, _)) if status.is_terminal() => Ok(status),
        // Same lease, still sending: the store lost the update
        Some((status, _)) => Err(Error::other(format!(
            "finalize of broadcast {id} matched no row while {status}"
        ))),
    }
}

pub(crate) fn cutoff(older_than: Duration) -> Result<DateTime<Utc>> {
    let age = chrono::Duration::from_std(older_than)
        .map_err(|e| Error::with_source("lease age out of range", e))?;
    Ok(Utc::now() - age)
}

// ============================================================================
// Mock Implementation (for testing)
// ============================================================================

#[derive(Debug, Clone)]
struct BroadcastRow {
    broadcast: Broadcast,
    lease: Option<LeaseToken>,
    lease_acquired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MockState {
    next_broadcast_id: i64,
    next_user_id: i64,
    next_notification_id: i64,
    broadcasts: BTreeMap<BroadcastId, BroadcastRow>,
    users: BTreeMap<UserId, User>,
    notifications: BTreeMap<i64, Notification>,
    delivered: HashMap<(BroadcastId, UserId), i64>,
}

/// Decrements the in-flight counter even when the delivery future is dropped
struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory mock implementation of every storage trait
///
/// Useful for testing without database dependencies. Supports injecting
/// transient write failures and delivery latency, and records how many
/// deliveries ran at once.
#[derive(Default)]
pub struct MockStorage {
    state: RwLock<MockState>,
    failures: Mutex<HashMap<UserId, u32>>,
    attempts: Mutex<HashMap<(BroadcastId, UserId), u32>>,
    delivery_delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockStorage {
    /// Create a new mock repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every delivery
    pub fn with_delivery_delay(mut self, delay: Duration) -> Self {
        self.delivery_delay = Some(delay);
        self
    }

    /// Make the next `times` writes to `recipient` fail transiently
    pub fn fail_deliveries(&self, recipient: UserId, times: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(recipient, times);
        }
    }

    /// Make every write to `recipient` fail
    pub fn fail_all_deliveries(&self, recipient: UserId) {
        self.fail_deliveries(recipient, u32::MAX);
    }

    /// Number of write attempts made for a pair
    pub fn delivery_attempts(&self, broadcast_id: BroadcastId, recipient: UserId) -> u32 {
        self.attempts
            .lock()
            .map(|a| a.get(&(broadcast_id, recipient)).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Highest number of deliveries observed running at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Total notification records
    pub async fn notification_count(&self) -> usize {
        self.state.read().await.notifications.len()
    }

    /// Insert a user with a caller-chosen id
    pub async fn insert_user(&self, id: UserId, username: &str, active: bool) -> User {
        let mut state = self.state.write().await;
        let user = User {
            id,
            username: username.to_string(),
            email: format!("{username}@example.com"),
            active,
            created_at: Utc::now(),
        };
        state.next_user_id = state.next_user_id.max(id.0);
        state.users.insert(id, user.clone());
        user
    }

    fn take_failure(&self, recipient: UserId) -> bool {
        let Ok(mut failures) = self.failures.lock() else {
            return false;
        };
        match failures.get_mut(&recipient) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                true
            }
            _ => false,
        }
    }

    fn record_attempt(&self, broadcast_id: BroadcastId, recipient: UserId) {
        if let Ok(mut attempts) = self.attempts.lock() {
            *attempts.entry((broadcast_id, recipient)).or_insert(0) += 1;
        }
    }
}

#[async_trait]
impl BroadcastStore for MockStorage {
    async fn create_draft(&self, owner: UserId, title: &str, body: &str) -> Result<Broadcast> {
        let (title, body) = validate_draft(title, body)?;
        let mut state = self.state.write().await;
        state.next_broadcast_id += 1;

        let now = Utc::now();
        let broadcast = Broadcast {
            id: BroadcastId(state.next_broadcast_id),
            owner_id: owner,
            title,
            body,
            status: BroadcastStatus::Draft,
            created_at: now,
            updated_at: now,
            sent_at: None,
        };

        state.broadcasts.insert(
            broadcast.id,
            BroadcastRow {
                broadcast: broadcast.clone(),
                lease: None,
                lease_acquired_at: None,
            },
        );
        Ok(broadcast)
    }

    async fn get(&self, id: BroadcastId) -> Result<Option<Broadcast>> {
        let state = self.state.read().await;
        Ok(state.broadcasts.get(&id).map(|row| row.broadcast.clone()))
    }

    async fn list_by_owner(
        &self,
        owner: UserId,
        filter: &BroadcastFilter,
    ) -> Result<Page<Broadcast>> {
        let state = self.state.read().await;
        let mut matching: Vec<&Broadcast> = state
            .broadcasts
            .values()
            .map(|row| &row.broadcast)
            .filter(|b| b.owner_id == owner)
            .filter(|b| filter.status.map_or(true, |s| b.status == s))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(Page {
            total: matching.len() as u64,
            items: matching
                .into_iter()
                .skip(filter.offset() as usize)
                .take(filter.per_page as usize)
                .cloned()
                .collect(),
            page: filter.page,
            per_page: filter.per_page,
        })
    }

    async fn update_draft(
        &self,
        id: BroadcastId,
        owner: UserId,
        update: &BroadcastUpdate,
    ) -> Result<Broadcast> {
        let mut state = self.state.write().await;
        let row = state
            .broadcasts
            .get_mut(&id)
            .ok_or_else(|| DispatchError::not_found(id))?;

        if !row.broadcast.is_owned_by(owner) {
            return Err(DispatchError::forbidden(id, owner).into());
        }
        if row.broadcast.status != BroadcastStatus::Draft {
            return Err(DispatchError::invalid_state(id, row.broadcast.status).into());
        }

        let (title, body) = merge_update(&row.broadcast, update)?;
        row.broadcast.title = title;
        row.broadcast.body = body;
        row.broadcast.updated_at = Utc::now();
        Ok(row.broadcast.clone())
    }

    async fn delete_draft(&self, id: BroadcastId, owner: UserId) -> Result<()> {
        let mut state = self.state.write().await;
        let row = state
            .broadcasts
            .get(&id)
            .ok_or_else(|| DispatchError::not_found(id))?;

        if !row.broadcast.is_owned_by(owner) {
            return Err(DispatchError::forbidden(id, owner).into());
        }
        if row.broadcast.status != BroadcastStatus::Draft {
            return Err(DispatchError::invalid_state(id, row.broadcast.status).into());
        }

        state.broadcasts.remove(&id);
        state.notifications.retain(|_, n| n.broadcast_id != id);
        state.delivered.retain(|(b, _), _| *b != id);
        Ok(())
    }

    async fn try_begin_send(&self, id: BroadcastId, owner: UserId) -> Result<LeaseToken> {
        let mut state = self.state.write().await;
        let current = state
            .broadcasts
            .get(&id)
            .map(|row| (row.broadcast.owner_id, row.broadcast.status));

        match (current, state.broadcasts.get_mut(&id)) {
            (Some((row_owner, BroadcastStatus::Draft)), Some(row)) if row_owner == owner => {
                let lease = LeaseToken::generate();
                let now = Utc::now();
                row.broadcast.status = BroadcastStatus::Sending;
                row.broadcast.updated_at = now;
                row.lease = Some(lease);
                row.lease_acquired_at = Some(now);
                Ok(lease)
            }
            _ => Err(reject_begin(id, owner, current).into()),
        }
    }

    async fn finalize(
        &self,
        id: BroadcastId,
        lease: LeaseToken,
        outcome: DispatchOutcome,
    ) -> Result<BroadcastStatus> {
        let mut state = self.state.write().await;
        match state.broadcasts.get_mut(&id) {
            Some(row)
                if row.lease == Some(lease) && row.broadcast.status == BroadcastStatus::Sending =>
            {
                let status = outcome.final_status();
                let now = Utc::now();
                row.broadcast.status = status;
                row.broadcast.updated_at = now;
                if status == BroadcastStatus::Sent {
                    row.broadcast.sent_at = Some(now);
                }
                Ok(status)
            }
            Some(row) => resolve_finalize_miss(id, lease, Some((row.broadcast.status, row.lease))),
            None => resolve_finalize_miss(id, lease, None),
        }
    }

    async fn expire_stale_leases(&self, older_than: Duration) -> Result<Vec<BroadcastId>> {
        let cutoff = cutoff(older_than)?;
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut expired = Vec::new();

        for (id, row) in state.broadcasts.iter_mut() {
            let stale = row.broadcast.status == BroadcastStatus::Sending
                && row.lease_acquired_at.map_or(true, |at| at <= cutoff);
            if stale {
                row.broadcast.status = BroadcastStatus::Failed;
                row.broadcast.updated_at = now;
                row.lease = None;
                expired.push(*id);
            }
        }

        Ok(expired)
    }
}

#[async_trait]
impl UserDirectory for MockStorage {
    async fn create_user(&self, username: &str, email: &str) -> Result<User> {
        let (username, email) = validate_user(username, email)?;
        let mut state = self.state.write().await;

        if state
            .users
            .values()
            .any(|u| u.username == username || u.email == email)
        {
            return Err(DispatchError::validation(format!("user {username} already exists")).into());
        }

        state.next_user_id += 1;
        let user = User {
            id: UserId(state.next_user_id),
            username,
            email,
            active: true,
            created_at: Utc::now(),
        };
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn deactivate_user(&self, id: UserId) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(match state.users.get_mut(&id) {
            Some(user) if user.active => {
                user.active = false;
                true
            }
            _ => false,
        })
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.state.read().await.users.values().cloned().collect())
    }

    async fn active_user_ids(&self) -> Result<Vec<UserId>> {
        let state = self.state.read().await;
        Ok(state
            .users
            .values()
            .filter(|u| u.active)
            .map(|u| u.id)
            .collect())
    }

    async fn known_user_ids(&self, ids: &[UserId]) -> Result<BTreeSet<UserId>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter(|id| state.users.get(*id).is_some_and(|u| u.active))
            .copied()
            .collect())
    }
}

#[async_trait]
impl NotificationWriter for MockStorage {
    async fn deliver(
        &self,
        broadcast_id: BroadcastId,
        recipient_id: UserId,
    ) -> std::result::Result<DeliveryStatus, WriteError> {
        let _guard = InFlightGuard::enter(&self.in_flight, &self.peak_in_flight);

        if let Some(delay) = self.delivery_delay {
            tokio::time::sleep(delay).await;
        }

        self.record_attempt(broadcast_id, recipient_id);
        if self.take_failure(recipient_id) {
            return Err(WriteError::write_failed(recipient_id, "injected failure"));
        }

        let mut state = self.state.write().await;
        if !state.broadcasts.contains_key(&broadcast_id) {
            return Err(WriteError::write_failed(
                recipient_id,
                format!("broadcast {broadcast_id} does not exist"),
            ));
        }
        if state.delivered.contains_key(&(broadcast_id, recipient_id)) {
            return Ok(DeliveryStatus::AlreadyDelivered);
        }

        state.next_notification_id += 1;
        let notification = Notification {
            id: state.next_notification_id,
            broadcast_id,
            recipient_id,
            delivered_at: Utc::now(),
            read: false,
            read_at: None,
        };
        state
            .delivered
            .insert((broadcast_id, recipient_id), notification.id);
        state.notifications.insert(notification.id, notification);
        Ok(DeliveryStatus::Delivered)
    }
}

#[async_trait]
impl NotificationReader for MockStorage {
    async fn list_for_broadcast(&self, broadcast_id: BroadcastId) -> Result<Vec<Notification>> {
        let state = self.state.read().await;
        let mut items: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| n.broadcast_id == broadcast_id)
            .cloned()
            .collect();
        items.sort_by_key(|n| n.recipient_id);
        Ok(items)
    }

    async fn list_for_recipient(
        &self,
        recipient_id: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<Page<Notification>> {
        let filter = BroadcastFilter::new(page, per_page);
        let state = self.state.read().await;
        let mut items: Vec<&Notification> = state
            .notifications
            .values()
            .filter(|n| n.recipient_id == recipient_id)
            .collect();
        items.sort_by(|a, b| b.delivered_at.cmp(&a.delivered_at).then(b.id.cmp(&a.id)));

        Ok(Page {
            total: items.len() as u64,
            items: items
                .into_iter()
                .skip(filter.offset() as usize)
                .take(filter.per_page as usize)
                .cloned()
                .collect(),
            page: filter.page,
            per_page: filter.per_page,
        })
    }

    async fn mark_read(&self, notification_id: i64, recipient_id: UserId) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(match state.notifications.get_mut(&notification_id) {
            Some(n) if n.recipient_id == recipient_id && !n.read => {
                n.read = true;
                n.read_at = Some(Utc::now());
                true
            }
            _ => false,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage_with_draft() -> (MockStorage, Broadcast) {
        let storage = MockStorage::new();
        let owner = storage.create_user("owner", "owner@example.com").await.unwrap();
        let draft = storage
            .create_draft(owner.id, "Maintenance", "Servers restart at 02:00")
            .await
            .unwrap();
        (storage, draft)
    }

    #[tokio::test]
    async fn test_create_draft_validates_title() {
        let storage = MockStorage::new();
        let err = storage.create_draft(UserId(1), "   ", "body").await.unwrap_err();
        assert!(matches!(err.as_dispatch(), Some(DispatchError::Validation(_))));
    }

    #[tokio::test]
    async fn test_begin_send_rejections() {
        let (storage, draft) = storage_with_draft().await;

        let err = storage
            .try_begin_send(BroadcastId(999), draft.owner_id)
            .await
            .unwrap_err();
        assert!(matches!(err.as_dispatch(), Some(DispatchError::NotFound { .. })));

        let err = storage
            .try_begin_send(draft.id, UserId(42))
            .await
            .unwrap_err();
        assert!(matches!(err.as_dispatch(), Some(DispatchError::Forbidden { .. })));

        storage.try_begin_send(draft.id, draft.owner_id).await.unwrap();
        let err = storage
            .try_begin_send(draft.id, draft.owner_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err.as_dispatch(),
            Some(DispatchError::InvalidState {
                status: BroadcastStatus::Sending,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent_per_lease() {
        let (storage, draft) = storage_with_draft().await;
        let lease = storage.try_begin_send(draft.id, draft.owner_id).await.unwrap();

        let status = storage
            .finalize(draft.id, lease, DispatchOutcome::new(3, 1))
            .await
            .unwrap();
        assert_eq!(status, BroadcastStatus::Sent);
        let sent_at = storage.get(draft.id).await.unwrap().unwrap().sent_at;
        assert!(sent_at.is_some());

        // Second call: no-op, even with a different outcome
        let status = storage
            .finalize(draft.id, lease, DispatchOutcome::new(0, 4))
            .await
            .unwrap();
        assert_eq!(status, BroadcastStatus::Sent);
        assert_eq!(storage.get(draft.id).await.unwrap().unwrap().sent_at, sent_at);
    }

    #[tokio::test]
    async fn test_finalize_rejects_foreign_lease() {
        let (storage, draft) = storage_with_draft().await;
        storage.try_begin_send(draft.id, draft.owner_id).await.unwrap();

        let err = storage
            .finalize(draft.id, LeaseToken::generate(), DispatchOutcome::new(1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err.as_dispatch(), Some(DispatchError::StaleLease { .. })));
        assert_eq!(
            storage.get(draft.id).await.unwrap().unwrap().status,
            BroadcastStatus::Sending
        );
    }

    #[tokio::test]
    async fn test_expired_lease_cannot_finalize() {
        let (storage, draft) = storage_with_draft().await;
        let lease = storage.try_begin_send(draft.id, draft.owner_id).await.unwrap();

        let expired = storage.expire_stale_leases(Duration::ZERO).await.unwrap();
        assert_eq!(expired, vec![draft.id]);

        let err = storage
            .finalize(draft.id, lease, DispatchOutcome::new(1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err.as_dispatch(), Some(DispatchError::StaleLease { .. })));
        assert_eq!(
            storage.get(draft.id).await.unwrap().unwrap().status,
            BroadcastStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_deliver_is_idempotent() {
        let (storage, draft) = storage_with_draft().await;
        let recipient = UserId(7);

        assert_eq!(
            storage.deliver(draft.id, recipient).await.unwrap(),
            DeliveryStatus::Delivered
        );
        assert_eq!(
            storage.deliver(draft.id, recipient).await.unwrap(),
            DeliveryStatus::AlreadyDelivered
        );
        assert_eq!(storage.notification_count().await, 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let (storage, draft) = storage_with_draft().await;
        storage.fail_deliveries(UserId(3), 1);

        assert!(storage.deliver(draft.id, UserId(3)).await.is_err());
        assert!(storage.deliver(draft.id, UserId(3)).await.is_ok());
        assert_eq!(storage.delivery_attempts(draft.id, UserId(3)), 2);
    }

    #[tokio::test]
    async fn test_delete_draft_cascades() {
        let (storage, draft) = storage_with_draft().await;
        storage.deliver(draft.id, UserId(2)).await.unwrap();

        storage.delete_draft(draft.id, draft.owner_id).await.unwrap();
        assert!(storage.get(draft.id).await.unwrap().is_none());
        assert_eq!(storage.notification_count().await, 0);
    }

    #[tokio::test]
    async fn test_known_user_ids_skips_inactive() {
        let storage = MockStorage::new();
        let alice = storage.create_user("alice", "alice@example.com").await.unwrap();
        let bob = storage.create_user("bob", "bob@example.com").await.unwrap();
        storage.deactivate_user(bob.id).await.unwrap();

        let known = storage
            .known_user_ids(&[alice.id, bob.id, UserId(99)])
            .await
            .unwrap();
        assert_eq!(known.into_iter().collect::<Vec<_>>(), vec![alice.id]);
        assert_eq!(storage.active_user_ids().await.unwrap(), vec![alice.id]);
    }

    #[tokio::test]
    async fn test_duplicate_user_rejected() {
        let storage = MockStorage::new();
        storage.create_user("alice", "alice@example.com").await.unwrap();
        assert!(storage
            .create_user("alice", "other@example.com")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_mark_read_only_by_recipient() {
        let (storage, draft) = storage_with_draft().await;
        storage.deliver(draft.id, UserId(5)).await.unwrap();
        let id = storage.list_for_broadcast(draft.id).await.unwrap()[0].id;

        assert!(!storage.mark_read(id, UserId(6)).await.unwrap());
        assert!(storage.mark_read(id, UserId(5)).await.unwrap());
        assert!(!storage.mark_read(id, UserId(5)).await.unwrap());

        let inbox = storage.list_for_recipient(UserId(5), 1, 10).await.unwrap();
        assert_eq!(inbox.total, 1);
        assert!(inbox.items[0].read);
    }
}
