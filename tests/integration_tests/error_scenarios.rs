//! Error scenario integration tests
//!
//! Tests failure modes and their effect on the final tally:
//! 1. Transient write failures and the retry bound
//! 2. Rejected sends (missing, foreign, already sent)
//! 3. Deadlines
//! 4. Stale leases after the reaper ran

use std::sync::Arc;
use std::time::Duration;

use herald::dispatch::{DispatchContext, DispatchError, Dispatcher, SendRequest};
use herald::error::{ErrorCategory, HeraldErrorTrait};
use herald::models::{BroadcastId, BroadcastStatus, DispatchOutcome, UserId};
use herald::storage::{BroadcastStore, MockStorage, SharedStorage};

use crate::common::{fast_config, mock_with_users, seed_users, sqlite_storage};

// ============================================================================
// Write Failure Tests
// ============================================================================

#[tokio::test]
async fn test_transient_failure_for_third_recipient() {
    let mock = mock_with_users(6).await;
    let owner = UserId(1);
    let id = mock.create_draft(owner, "Weekly", "Digest").await.unwrap().id;
    mock.fail_deliveries(UserId(4), 1);

    let dispatcher = Dispatcher::new(&SharedStorage::from_backend(mock.clone()), fast_config());
    let targets = [UserId(2), UserId(3), UserId(4), UserId(5), UserId(6)];
    let result = dispatcher
        .send(SendRequest::new(id, owner).with_targets(targets))
        .await
        .unwrap();

    assert_eq!(result.sent_count, 5);
    assert_eq!(result.failed_count, 0);
    assert_eq!(mock.delivery_attempts(id, UserId(4)), 2);
    assert_eq!(
        mock.get(id).await.unwrap().unwrap().status,
        BroadcastStatus::Sent
    );
}

#[tokio::test]
async fn test_attempts_never_exceed_bound() {
    let mock = mock_with_users(4).await;
    let owner = UserId(1);
    let id = mock.create_draft(owner, "Weekly", "Digest").await.unwrap().id;
    mock.fail_all_deliveries(UserId(2));

    let config = fast_config().with_retries(3, 1);
    let dispatcher = Dispatcher::new(&SharedStorage::from_backend(mock.clone()), config);
    let result = dispatcher.send(SendRequest::new(id, owner)).await.unwrap();

    assert_eq!(mock.delivery_attempts(id, UserId(2)), 4);
    assert_eq!(mock.delivery_attempts(id, UserId(3)), 1);
    assert_eq!(result.failed_recipient_ids, vec![UserId(2)]);
    assert_eq!(result.sent_count, 2);
}

// ============================================================================
// Rejection Tests
// ============================================================================

#[tokio::test]
async fn test_rejections_are_typed_and_not_recoverable() {
    let (_dir, storage) = sqlite_storage().await;
    let users = seed_users(&storage, 2).await;
    let draft = storage
        .broadcasts
        .create_draft(users[0].id, "Hello", "World")
        .await
        .unwrap();
    let dispatcher = Dispatcher::new(&storage, fast_config());

    let err = dispatcher
        .send(SendRequest::new(BroadcastId(9_999), users[0].id))
        .await
        .unwrap_err();
    assert!(matches!(err.as_dispatch(), Some(DispatchError::NotFound { .. })));
    assert!(!err.is_recoverable());
    assert_eq!(err.category(), ErrorCategory::Dispatch);

    let err = dispatcher
        .send(SendRequest::new(draft.id, users[1].id))
        .await
        .unwrap_err();
    assert!(matches!(err.as_dispatch(), Some(DispatchError::Forbidden { .. })));

    dispatcher
        .send(SendRequest::new(draft.id, users[0].id))
        .await
        .unwrap();
    let err = dispatcher
        .send(SendRequest::new(draft.id, users[0].id))
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_dispatch(),
        Some(DispatchError::InvalidState {
            status: BroadcastStatus::Sent,
            ..
        })
    ));
}

// ============================================================================
// Deadline Tests
// ============================================================================

#[tokio::test]
async fn test_deadline_with_slow_writer() {
    let mock = Arc::new(MockStorage::new().with_delivery_delay(Duration::from_millis(300)));
    for id in 1..=3 {
        mock.insert_user(UserId(id), &format!("user{id}"), true).await;
    }
    let id = mock.create_draft(UserId(1), "Slow", "Writer").await.unwrap().id;

    let dispatcher = Dispatcher::new(&SharedStorage::from_backend(mock.clone()), fast_config());
    let context = DispatchContext::new().with_timeout(Duration::from_millis(30));
    let result = dispatcher
        .send_with_context(SendRequest::new(id, UserId(1)), context)
        .await
        .unwrap();

    assert_eq!(result.sent_count, 0);
    assert_eq!(result.failed_count, 2);
    // Finalized rather than stuck in sending
    assert_eq!(
        mock.get(id).await.unwrap().unwrap().status,
        BroadcastStatus::Failed
    );
}

// ============================================================================
// Lease Tests
// ============================================================================

#[tokio::test]
async fn test_finalize_after_reaper_is_stale() {
    let (_dir, storage) = sqlite_storage().await;
    let users = seed_users(&storage, 1).await;
    let draft = storage
        .broadcasts
        .create_draft(users[0].id, "Crashed", "Dispatcher died")
        .await
        .unwrap();

    let lease = storage
        .broadcasts
        .try_begin_send(draft.id, users[0].id)
        .await
        .unwrap();

    let dispatcher = Dispatcher::new(&storage, fast_config());
    let reaped = dispatcher.reap_older_than(Duration::ZERO).await.unwrap();
    assert_eq!(reaped, vec![draft.id]);

    let err = storage
        .broadcasts
        .finalize(draft.id, lease, DispatchOutcome::new(1, 0))
        .await
        .unwrap_err();
    assert!(matches!(err.as_dispatch(), Some(DispatchError::StaleLease { .. })));
    assert_eq!(
        storage.broadcasts.get(draft.id).await.unwrap().unwrap().status,
        BroadcastStatus::Failed
    );
}

#[tokio::test]
async fn test_double_finalize_is_noop() {
    let (_dir, storage) = sqlite_storage().await;
    let users = seed_users(&storage, 1).await;
    let draft = storage
        .broadcasts
        .create_draft(users[0].id, "Once", "Only")
        .await
        .unwrap();
    let lease = storage
        .broadcasts
        .try_begin_send(draft.id, users[0].id)
        .await
        .unwrap();

    let first = storage
        .broadcasts
        .finalize(draft.id, lease, DispatchOutcome::new(0, 2))
        .await
        .unwrap();
    let second = storage
        .broadcasts
        .finalize(draft.id, lease, DispatchOutcome::new(2, 0))
        .await
        .unwrap();

    assert_eq!(first, BroadcastStatus::Failed);
    assert_eq!(second, BroadcastStatus::Failed);
}
