//! Draft lifecycle and inbox flows

use herald::dispatch::{DispatchError, Dispatcher, SendRequest};
use herald::models::{BroadcastFilter, BroadcastStatus, BroadcastUpdate};
use herald::storage::{BroadcastStore, NotificationReader, UserDirectory};

use crate::common::{fast_config, seed_users, sqlite_storage};

#[tokio::test]
async fn test_draft_edit_then_send_then_locked() {
    let (_dir, storage) = sqlite_storage().await;
    let users = seed_users(&storage, 3).await;
    let owner = users[0].id;

    let draft = storage
        .broadcasts
        .create_draft(owner, "Draft title", "Draft body")
        .await
        .unwrap();
    assert_eq!(draft.status, BroadcastStatus::Draft);

    let edited = storage
        .broadcasts
        .update_draft(
            draft.id,
            owner,
            &BroadcastUpdate {
                title: None,
                body: Some("Final body".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.title, "Draft title");
    assert_eq!(edited.body, "Final body");

    // Blank title is rejected
    let err = storage
        .broadcasts
        .update_draft(
            draft.id,
            owner,
            &BroadcastUpdate {
                title: Some("  ".to_string()),
                body: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err.as_dispatch(), Some(DispatchError::Validation(_))));

    Dispatcher::new(&storage, fast_config())
        .send(SendRequest::new(draft.id, owner))
        .await
        .unwrap();

    let err = storage
        .broadcasts
        .update_draft(draft.id, owner, &BroadcastUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err.as_dispatch(), Some(DispatchError::InvalidState { .. })));

    let err = storage
        .broadcasts
        .delete_draft(draft.id, owner)
        .await
        .unwrap_err();
    assert!(matches!(err.as_dispatch(), Some(DispatchError::InvalidState { .. })));
}

#[tokio::test]
async fn test_list_by_owner_only_shows_own() {
    let (_dir, storage) = sqlite_storage().await;
    let users = seed_users(&storage, 2).await;

    for i in 0..3 {
        storage
            .broadcasts
            .create_draft(users[0].id, &format!("Mine {i}"), "Body")
            .await
            .unwrap();
    }
    storage
        .broadcasts
        .create_draft(users[1].id, "Theirs", "Body")
        .await
        .unwrap();

    let page = storage
        .broadcasts
        .list_by_owner(users[0].id, &BroadcastFilter::default())
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert!(page.items.iter().all(|b| b.owner_id == users[0].id));

    let drafts = storage
        .broadcasts
        .list_by_owner(
            users[1].id,
            &BroadcastFilter::default().with_status(BroadcastStatus::Sent),
        )
        .await
        .unwrap();
    assert_eq!(drafts.total, 0);
}

#[tokio::test]
async fn test_get_owned_checks_owner() {
    let (_dir, storage) = sqlite_storage().await;
    let users = seed_users(&storage, 2).await;
    let draft = storage
        .broadcasts
        .create_draft(users[0].id, "Private", "Draft")
        .await
        .unwrap();

    assert!(storage.broadcasts.get_owned(draft.id, users[0].id).await.is_ok());
    let err = storage
        .broadcasts
        .get_owned(draft.id, users[1].id)
        .await
        .unwrap_err();
    assert!(matches!(err.as_dispatch(), Some(DispatchError::Forbidden { .. })));
}

#[tokio::test]
async fn test_inbox_after_dispatch() {
    let (_dir, storage) = sqlite_storage().await;
    let users = seed_users(&storage, 3).await;
    let owner = users[0].id;
    let reader = users[2].id;
    let dispatcher = Dispatcher::new(&storage, fast_config());

    for title in ["First", "Second"] {
        let draft = storage
            .broadcasts
            .create_draft(owner, title, "Body")
            .await
            .unwrap();
        dispatcher.send(SendRequest::new(draft.id, owner)).await.unwrap();
    }

    let inbox = storage.reader.list_for_recipient(reader, 1, 10).await.unwrap();
    assert_eq!(inbox.total, 2);
    assert!(inbox.items.iter().all(|n| !n.read));
    // Newest first
    assert!(inbox.items[0].broadcast_id > inbox.items[1].broadcast_id);

    let first = inbox.items[0].id;
    assert!(!storage.reader.mark_read(first, users[1].id).await.unwrap());
    assert!(storage.reader.mark_read(first, reader).await.unwrap());
    assert!(!storage.reader.mark_read(first, reader).await.unwrap());

    let inbox = storage.reader.list_for_recipient(reader, 1, 1).await.unwrap();
    assert_eq!(inbox.items.len(), 1);
    assert_eq!(inbox.pages(), 2);
    assert!(inbox.items[0].read);
}

#[tokio::test]
async fn test_duplicate_user_is_rejected() {
    let (_dir, storage) = sqlite_storage().await;
    seed_users(&storage, 1).await;

    let err = storage
        .users
        .create_user("user1", "someone-else@example.com")
        .await
        .unwrap_err();
    assert!(matches!(err.as_dispatch(), Some(DispatchError::Validation(_))));
    assert_eq!(storage.users.list_users().await.unwrap().len(), 1);
}
