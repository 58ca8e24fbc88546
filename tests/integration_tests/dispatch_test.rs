//! Dispatch against a real SQLite database

use std::sync::Arc;

use herald::dispatch::{Dispatcher, SendRequest};
use herald::models::{BroadcastStatus, UserId};
use herald::storage::{BroadcastStore, NotificationReader, NotificationWriter, UserDirectory};

use crate::common::{fast_config, ids, seed_users, sqlite_storage};

#[tokio::test]
async fn test_send_to_all_active_users() {
    let (_dir, storage) = sqlite_storage().await;
    let users = seed_users(&storage, 5).await;
    let owner = users[0].id;
    storage.users.deactivate_user(users[4].id).await.unwrap();

    let draft = storage
        .broadcasts
        .create_draft(owner, "Release 2.0", "Ships tonight")
        .await
        .unwrap();

    let dispatcher = Dispatcher::new(&storage, fast_config());
    let result = dispatcher.send(SendRequest::new(draft.id, owner)).await.unwrap();

    assert_eq!(result.sent_count, 3);
    assert_eq!(result.failed_count, 0);

    let stored = storage.broadcasts.get(draft.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BroadcastStatus::Sent);
    assert!(stored.sent_at.is_some());

    let delivered: Vec<UserId> = storage
        .reader
        .list_for_broadcast(draft.id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.recipient_id)
        .collect();
    assert_eq!(delivered, ids(&users[1..4]));
}

#[tokio::test]
async fn test_explicit_targets_with_unknown_ids() {
    let (_dir, storage) = sqlite_storage().await;
    let users = seed_users(&storage, 4).await;
    let owner = users[0].id;
    let draft = storage
        .broadcasts
        .create_draft(owner, "Survey", "Please answer by Monday")
        .await
        .unwrap();

    let request = SendRequest::new(draft.id, owner).with_targets([
        users[2].id,
        UserId(500),
        users[1].id,
        users[2].id,
    ]);
    let result = Dispatcher::new(&storage, fast_config())
        .send(request)
        .await
        .unwrap();

    assert_eq!(result.sent_count, 2);
    assert_eq!(result.failed_count, 1);
    assert_eq!(result.failed_recipient_ids, vec![UserId(500)]);
    assert_eq!(result.total(), 3);
}

#[tokio::test]
async fn test_all_unknown_targets_fail() {
    let (_dir, storage) = sqlite_storage().await;
    let users = seed_users(&storage, 1).await;
    let draft = storage
        .broadcasts
        .create_draft(users[0].id, "Hello", "Nobody home")
        .await
        .unwrap();

    let request = SendRequest::new(draft.id, users[0].id)
        .with_targets([UserId(101), UserId(102), UserId(103)]);
    let result = Dispatcher::new(&storage, fast_config())
        .send(request)
        .await
        .unwrap();

    assert_eq!(result.sent_count, 0);
    assert_eq!(result.failed_count, 3);
    assert_eq!(
        storage.broadcasts.get(draft.id).await.unwrap().unwrap().status,
        BroadcastStatus::Failed
    );
}

#[tokio::test]
async fn test_empty_population_sends_nothing() {
    let (_dir, storage) = sqlite_storage().await;
    let users = seed_users(&storage, 1).await;
    let draft = storage
        .broadcasts
        .create_draft(users[0].id, "Hello", "Just me")
        .await
        .unwrap();

    let result = Dispatcher::new(&storage, fast_config())
        .send(SendRequest::new(draft.id, users[0].id))
        .await
        .unwrap();

    assert_eq!(result.sent_count, 0);
    assert_eq!(result.failed_count, 0);
    assert_eq!(
        storage.broadcasts.get(draft.id).await.unwrap().unwrap().status,
        BroadcastStatus::Sent
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_on_sqlite() {
    let (_dir, storage) = sqlite_storage().await;
    let users = seed_users(&storage, 20).await;
    let owner = users[0].id;
    let draft = storage
        .broadcasts
        .create_draft(owner, "Race", "Only one wins")
        .await
        .unwrap();

    let dispatcher = Arc::new(Dispatcher::new(&storage, fast_config()));
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.send(SendRequest::new(draft.id, owner)).await })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    let successes: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].sent_count, 19);
    assert_eq!(
        storage.reader.list_for_broadcast(draft.id).await.unwrap().len(),
        19
    );
}

#[tokio::test]
async fn test_redelivery_is_counted_not_duplicated() {
    let (_dir, storage) = sqlite_storage().await;
    let users = seed_users(&storage, 3).await;
    let owner = users[0].id;
    let draft = storage
        .broadcasts
        .create_draft(owner, "Hello", "Again")
        .await
        .unwrap();

    // A previous, abandoned run already reached user 2
    storage.writer.deliver(draft.id, users[1].id).await.unwrap();

    let result = Dispatcher::new(&storage, fast_config())
        .send(SendRequest::new(draft.id, owner))
        .await
        .unwrap();

    assert_eq!(result.sent_count, 2);
    assert_eq!(
        storage.reader.list_for_broadcast(draft.id).await.unwrap().len(),
        2
    );
}
