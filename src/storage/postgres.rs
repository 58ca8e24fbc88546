//! PostgreSQL storage backend
//!
//! Pooled connections via `deadpool-postgres`. Every status transition is a
//! single conditional `UPDATE ... RETURNING`, so several dispatcher processes
//! can share one database without losing single-flight.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use super::repository::{
    cutoff, merge_update, reject_begin, resolve_finalize_miss, validate_draft, validate_user,
    BroadcastStore, DeliveryStatus, NotificationReader, NotificationWriter, UserDirectory,
};
use crate::config::DatabaseConfig;
use crate::dispatch::error::{DispatchError, WriteError};
use crate::error::{Error, Result};
use crate::models::{
    Broadcast, BroadcastFilter, BroadcastId, BroadcastStatus, BroadcastUpdate, DispatchOutcome,
    LeaseToken, Notification, Page, User, UserId,
};

const BROADCAST_COLUMNS: &str =
    "id, owner_id, title, body, status, created_at, updated_at, sent_at";

const NOTIFICATION_COLUMNS: &str =
    "id, broadcast_id, recipient_id, delivered_at, is_read, read_at";

fn parse_status(value: &str) -> Result<BroadcastStatus> {
    BroadcastStatus::parse(value)
        .ok_or_else(|| Error::other(format!("unknown broadcast status in database: {value}")))
}

fn broadcast_from_row(row: &Row) -> Result<Broadcast> {
    Ok(Broadcast {
        id: BroadcastId(row.try_get(0)?),
        owner_id: UserId(row.try_get(1)?),
        title: row.try_get(2)?,
        body: row.try_get(3)?,
        status: parse_status(row.try_get(4)?)?,
        created_at: row.try_get(5)?,
        updated_at: row.try_get(6)?,
        sent_at: row.try_get(7)?,
    })
}

fn notification_from_row(row: &Row) -> Result<Notification> {
    Ok(Notification {
        id: row.try_get(0)?,
        broadcast_id: BroadcastId(row.try_get(1)?),
        recipient_id: UserId(row.try_get(2)?),
        delivered_at: row.try_get(3)?,
        read: row.try_get(4)?,
        read_at: row.try_get(5)?,
    })
}

fn user_from_row(row: &Row) -> Result<User> {
    Ok(User {
        id: UserId(row.try_get(0)?),
        username: row.try_get(1)?,
        email: row.try_get(2)?,
        active: row.try_get(3)?,
        created_at: row.try_get(4)?,
    })
}

/// PostgreSQL implementation of every storage trait
pub struct PostgresStorage {
    pool: Pool,
}

impl PostgresStorage {
    /// Create the pool and verify connectivity
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut pool_config = PoolConfig::new();
        pool_config.url = Some(config.postgres_url.clone());
        pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        pool_config.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_size));

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| Error::with_source("Failed to create PostgreSQL connection pool", e))?;

        // Test connection
        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;

        tracing::info!(pool_size = config.pool_size, "PostgreSQL storage connected");
        Ok(Self { pool })
    }

    /// Initialize database schema
    pub async fn init_schema(&self) -> Result<()> {
        let client = self.pool.get().await?;

        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id BIGSERIAL PRIMARY KEY,
                    username TEXT NOT NULL UNIQUE,
                    email TEXT NOT NULL UNIQUE,
                    active BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                );

                CREATE TABLE IF NOT EXISTS broadcasts (
                    id BIGSERIAL PRIMARY KEY,
                    owner_id BIGINT NOT NULL REFERENCES users(id),
                    title TEXT NOT NULL,
                    body TEXT NOT NULL,
                    status VARCHAR(16) NOT NULL DEFAULT 'draft'
                        CHECK (status IN ('draft', 'sending', 'sent', 'failed')),
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    sent_at TIMESTAMPTZ,
                    lease_token UUID,
                    lease_acquired_at TIMESTAMPTZ
                );

                CREATE INDEX IF NOT EXISTS idx_broadcasts_owner
                    ON broadcasts(owner_id, created_at);

                CREATE INDEX IF NOT EXISTS idx_broadcasts_status
                    ON broadcasts(status);

                CREATE TABLE IF NOT EXISTS notifications (
                    id BIGSERIAL PRIMARY KEY,
                    broadcast_id BIGINT NOT NULL REFERENCES broadcasts(id) ON DELETE CASCADE,
                    recipient_id BIGINT NOT NULL REFERENCES users(id),
                    delivered_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    is_read BOOLEAN NOT NULL DEFAULT FALSE,
                    read_at TIMESTAMPTZ,
                    UNIQUE (broadcast_id, recipient_id)
                );

                CREATE INDEX IF NOT EXISTS idx_notifications_recipient
                    ON notifications(recipient_id, delivered_at);
                "#,
            )
            .await?;

        tracing::info!("Broadcast schema initialized");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn current_owner_status(
        client: &deadpool_postgres::Client,
        id: BroadcastId,
    ) -> Result<Option<(UserId, BroadcastStatus)>> {
        let row = client
            .query_opt(
                "SELECT owner_id, status FROM broadcasts WHERE id = $1",
                &[&id.0],
            )
            .await?;

        match row {
            Some(row) => {
                let status: &str = row.try_get(1)?;
                Ok(Some((UserId(row.try_get(0)?), parse_status(status)?)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BroadcastStore for PostgresStorage {
    async fn create_draft(&self, owner: UserId, title: &str, body: &str) -> Result<Broadcast> {
        let (title, body) = validate_draft(title, body)?;
        let client = self.pool.get().await?;

        let row = client
            .query_one(
                &format!(
                    "INSERT INTO broadcasts (owner_id, title, body, status)
                     VALUES ($1, $2, $3, 'draft')
                     RETURNING {BROADCAST_COLUMNS}"
                ),
                &[&owner.0, &title, &body],
            )
            .await?;

        broadcast_from_row(&row)
    }

    async fn get(&self, id: BroadcastId) -> Result<Option<Broadcast>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE id = $1"),
                &[&id.0],
            )
            .await?;

        row.as_ref().map(broadcast_from_row).transpose()
    }

    async fn list_by_owner(
        &self,
        owner: UserId,
        filter: &BroadcastFilter,
    ) -> Result<Page<Broadcast>> {
        let client = self.pool.get().await?;
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = client
            .query_one(
                "SELECT COUNT(*) FROM broadcasts
                 WHERE owner_id = $1 AND ($2::text IS NULL OR status = $2::text)",
                &[&owner.0, &status],
            )
            .await?
            .try_get(0)?;

        let rows = client
            .query(
                &format!(
                    "SELECT {BROADCAST_COLUMNS} FROM broadcasts
                     WHERE owner_id = $1 AND ($2::text IS NULL OR status = $2::text)
                     ORDER BY created_at DESC, id DESC
                     LIMIT $3 OFFSET $4"
                ),
                &[
                    &owner.0,
                    &status,
                    &i64::from(filter.per_page),
                    &(filter.offset() as i64),
                ],
            )
            .await?;

        Ok(Page {
            items: rows.iter().map(broadcast_from_row).collect::<Result<_>>()?,
            total: total as u64,
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
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| DispatchError::not_found(id))?;
        if !current.is_owned_by(owner) {
            return Err(DispatchError::forbidden(id, owner).into());
        }
        let (title, body) = merge_update(&current, update)?;

        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE broadcasts SET title = $3, body = $4, updated_at = NOW()
                     WHERE id = $1 AND owner_id = $2 AND status = 'draft'
                     RETURNING {BROADCAST_COLUMNS}"
                ),
                &[&id.0, &owner.0, &title, &body],
            )
            .await?;

        match row {
            Some(row) => broadcast_from_row(&row),
            None => Err(reject_begin(id, owner, Self::current_owner_status(&client, id).await?).into()),
        }
    }

    async fn delete_draft(&self, id: BroadcastId, owner: UserId) -> Result<()> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute(
                "DELETE FROM broadcasts WHERE id = $1 AND owner_id = $2 AND status = 'draft'",
                &[&id.0, &owner.0],
            )
            .await?;

        if deleted == 0 {
            return Err(reject_begin(id, owner, Self::current_owner_status(&client, id).await?).into());
        }
        Ok(())
    }

    async fn try_begin_send(&self, id: BroadcastId, owner: UserId) -> Result<LeaseToken> {
        let client = self.pool.get().await?;
        let lease = LeaseToken::generate();

        let changed = client
            .execute(
                "UPDATE broadcasts
                 SET status = 'sending', lease_token = $3, lease_acquired_at = NOW(), updated_at = NOW()
                 WHERE id = $1 AND owner_id = $2 AND status = 'draft'",
                &[&id.0, &owner.0, &lease.as_uuid()],
            )
            .await?;

        if changed == 1 {
            return Ok(lease);
        }

        Err(reject_begin(id, owner, Self::current_owner_status(&client, id).await?).into())
    }

    async fn finalize(
        &self,
        id: BroadcastId,
        lease: LeaseToken,
        outcome: DispatchOutcome,
    ) -> Result<BroadcastStatus> {
        let client = self.pool.get().await?;
        let status = outcome.final_status();

        let changed = client
            .execute(
                "UPDATE broadcasts
                 SET status = $3::text,
                     updated_at = NOW(),
                     sent_at = CASE WHEN $3::text = 'sent' THEN NOW() ELSE sent_at END
                 WHERE id = $1 AND lease_token = $2 AND status = 'sending'",
                &[&id.0, &lease.as_uuid(), &status.as_str()],
            )
            .await?;

        if changed == 1 {
            return Ok(status);
        }

        let current = match client
            .query_opt(
                "SELECT status, lease_token FROM broadcasts WHERE id = $1",
                &[&id.0],
            )
            .await?
        {
            Some(row) => {
                let status: &str = row.try_get(0)?;
                let held: Option<Uuid> = row.try_get(1)?;
                Some((parse_status(status)?, held.map(LeaseToken::from_uuid)))
            }
            None => None,
        };
        resolve_finalize_miss(id, lease, current)
    }

    async fn expire_stale_leases(&self, older_than: Duration) -> Result<Vec<BroadcastId>> {
        let cutoff = cutoff(older_than)?;
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "UPDATE broadcasts
                 SET status = 'failed', lease_token = NULL, updated_at = NOW()
                 WHERE status = 'sending'
                   AND (lease_acquired_at IS NULL OR lease_acquired_at <= $1)
                 RETURNING id",
                &[&cutoff],
            )
            .await?;

        let mut expired = rows
            .iter()
            .map(|row| row.try_get(0).map(BroadcastId))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        expired.sort();
        Ok(expired)
    }
}

#[async_trait]
impl UserDirectory for PostgresStorage {
    async fn create_user(&self, username: &str, email: &str) -> Result<User> {
        let (username, email) = validate_user(username, email)?;
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "INSERT INTO users (username, email) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING
                 RETURNING id, username, email, active, created_at",
                &[&username, &email],
            )
            .await?;

        match row {
            Some(row) => user_from_row(&row),
            None => Err(DispatchError::validation(format!("user {username} already exists")).into()),
        }
    }

    async fn deactivate_user(&self, id: UserId) -> Result<bool> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                "UPDATE users SET active = FALSE WHERE id = $1 AND active",
                &[&id.0],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, username, email, active, created_at FROM users ORDER BY id",
                &[],
            )
            .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn active_user_ids(&self) -> Result<Vec<UserId>> {
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT id FROM users WHERE active ORDER BY id", &[])
            .await?;
        Ok(rows
            .iter()
            .map(|row| row.try_get(0).map(UserId))
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn known_user_ids(&self, ids: &[UserId]) -> Result<BTreeSet<UserId>> {
        if ids.is_empty() {
            return Ok(BTreeSet::new());
        }

        let raw: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id FROM users WHERE active AND id = ANY($1)",
                &[&raw],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| row.try_get(0).map(UserId))
            .collect::<std::result::Result<_, _>>()?)
    }
}

#[async_trait]
impl NotificationWriter for PostgresStorage {
    async fn deliver(
        &self,
        broadcast_id: BroadcastId,
        recipient_id: UserId,
    ) -> std::result::Result<DeliveryStatus, WriteError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| WriteError::write_failed(recipient_id, e.to_string()))?;

        let row = client
            .query_opt(
                "INSERT INTO notifications (broadcast_id, recipient_id)
                 VALUES ($1, $2)
                 ON CONFLICT (broadcast_id, recipient_id) DO NOTHING
                 RETURNING id",
                &[&broadcast_id.0, &recipient_id.0],
            )
            .await
            .map_err(|e| WriteError::write_failed(recipient_id, e.to_string()))?;

        Ok(if row.is_some() {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::AlreadyDelivered
        })
    }
}

#[async_trait]
impl NotificationReader for PostgresStorage {
    async fn list_for_broadcast(&self, broadcast_id: BroadcastId) -> Result<Vec<Notification>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                     WHERE broadcast_id = $1 ORDER BY recipient_id"
                ),
                &[&broadcast_id.0],
            )
            .await?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn list_for_recipient(
        &self,
        recipient_id: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<Page<Notification>> {
        let filter = BroadcastFilter::new(page, per_page);
        let client = self.pool.get().await?;

        let total: i64 = client
            .query_one(
                "SELECT COUNT(*) FROM notifications WHERE recipient_id = $1",
                &[&recipient_id.0],
            )
            .await?
            .try_get(0)?;

        let rows = client
            .query(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                     WHERE recipient_id = $1
                     ORDER BY delivered_at DESC, id DESC
                     LIMIT $2 OFFSET $3"
                ),
                &[
                    &recipient_id.0,
                    &i64::from(filter.per_page),
                    &(filter.offset() as i64),
                ],
            )
            .await?;

        Ok(Page {
            items: rows.iter().map(notification_from_row).collect::<Result<_>>()?,
            total: total as u64,
            page: filter.page,
            per_page: filter.per_page,
        })
    }

    async fn mark_read(&self, notification_id: i64, recipient_id: UserId) -> Result<bool> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                "UPDATE notifications SET is_read = TRUE, read_at = $3
                 WHERE id = $1 AND recipient_id = $2 AND NOT is_read",
                &[&notification_id, &recipient_id.0, &Utc::now()],
            )
            .await?;
        Ok(changed > 0)
    }
}
