//! Common test utilities

use std::sync::Arc;

use herald::config::{DatabaseConfig, DispatchConfig};
use herald::models::{User, UserId};
use herald::storage::{self, MockStorage, SharedStorage, UserDirectory};
use tempfile::TempDir;

/// Dispatch settings with millisecond retry delays
pub fn fast_config() -> DispatchConfig {
    DispatchConfig::default().with_retries(1, 1)
}

/// Open a SQLite-backed storage in a fresh temporary directory.
///
/// Keep the `TempDir` alive for as long as the storage is used.
pub async fn sqlite_storage() -> (TempDir, SharedStorage) {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig {
        sqlite_path: dir.path().join("herald.db"),
        ..Default::default()
    };
    let storage = storage::open(&config).await.unwrap();
    (dir, storage)
}

/// Register `count` users named user1..userN
pub async fn seed_users(storage: &SharedStorage, count: usize) -> Vec<User> {
    let mut users = Vec::with_capacity(count);
    for i in 1..=count {
        let user = storage
            .users
            .create_user(&format!("user{i}"), &format!("user{i}@example.com"))
            .await
            .unwrap();
        users.push(user);
    }
    users
}

/// Mock storage with active users 1..=count
#[allow(dead_code)]
pub async fn mock_with_users(count: i64) -> Arc<MockStorage> {
    let mock = Arc::new(MockStorage::new());
    for id in 1..=count {
        mock.insert_user(UserId(id), &format!("user{id}"), true).await;
    }
    mock
}

#[allow(dead_code)]
pub fn ids(users: &[User]) -> Vec<UserId> {
    users.iter().map(|u| u.id).collect()
}
