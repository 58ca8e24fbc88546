//! SQLite storage backend
//!
//! A single connection behind a `Mutex`, WAL mode, and foreign keys enabled so
//! deleting a draft cascades to its notifications. Status transitions are
//! conditional `UPDATE`s, so the same single-flight guarantee holds when several
//! processes share one database file.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::repository::{
    cutoff, merge_update, reject_begin, resolve_finalize_miss, validate_draft, validate_user,
    BroadcastStore, DeliveryStatus, NotificationReader, NotificationWriter, UserDirectory,
};
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

/// Fixed-width UTC timestamps so text comparison orders correctly
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {value}: {e}")))
}

fn get_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(idx, &row.get::<_, String>(idx)?)
}

fn get_optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|value| parse_timestamp(idx, &value))
        .transpose()
}

fn get_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<BroadcastStatus> {
    let value: String = row.get(idx)?;
    BroadcastStatus::parse(&value).ok_or_else(|| conversion_error(idx, format!("bad status {value}")))
}

fn get_lease(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<LeaseToken>> {
    row.get::<_, Option<String>>(idx)?
        .map(|value| {
            Uuid::parse_str(&value)
                .map(LeaseToken::from_uuid)
                .map_err(|e| conversion_error(idx, format!("bad lease {value}: {e}")))
        })
        .transpose()
}

fn broadcast_from_row(row: &Row<'_>) -> rusqlite::Result<Broadcast> {
    Ok(Broadcast {
        id: BroadcastId(row.get(0)?),
        owner_id: UserId(row.get(1)?),
        title: row.get(2)?,
        body: row.get(3)?,
        status: get_status(row, 4)?,
        created_at: get_timestamp(row, 5)?,
        updated_at: get_timestamp(row, 6)?,
        sent_at: get_optional_timestamp(row, 7)?,
    })
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        broadcast_id: BroadcastId(row.get(1)?),
        recipient_id: UserId(row.get(2)?),
        delivered_at: get_timestamp(row, 3)?,
        read: row.get(4)?,
        read_at: get_optional_timestamp(row, 5)?,
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: UserId(row.get(0)?),
        username: row.get(1)?,
        email: row.get(2)?,
        active: row.get(3)?,
        created_at: get_timestamp(row, 4)?,
    })
}

/// SQLite implementation of every storage trait
///
/// Uses `Mutex` to ensure thread-safety for the SQLite connection.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) a database file
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;

        let storage = Self::from_connection(conn)?;
        tracing::info!(path = %path.display(), "SQLite storage initialized");
        Ok(storage)
    }

    /// Create in-memory storage (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.create_schema()?;
        Ok(storage)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::other("SQLite connection mutex poisoned"))
    }

    /// Create database schema
    fn create_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL UNIQUE,
                    email TEXT NOT NULL UNIQUE,
                    active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS broadcasts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner_id INTEGER NOT NULL REFERENCES users(id),
                    title TEXT NOT NULL,
                    body TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'draft'
                        CHECK (status IN ('draft', 'sending', 'sent', 'failed')),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    sent_at TEXT,
                    lease_token TEXT,
                    lease_acquired_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_broadcasts_owner
                    ON broadcasts(owner_id, created_at);

                CREATE INDEX IF NOT EXISTS idx_broadcasts_status
                    ON broadcasts(status);

                CREATE TABLE IF NOT EXISTS notifications (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    broadcast_id INTEGER NOT NULL REFERENCES broadcasts(id) ON DELETE CASCADE,
                    recipient_id INTEGER NOT NULL REFERENCES users(id),
                    delivered_at TEXT NOT NULL,
                    is_read INTEGER NOT NULL DEFAULT 0,
                    read_at TEXT,
                    UNIQUE (broadcast_id, recipient_id)
                );

                CREATE INDEX IF NOT EXISTS idx_notifications_recipient
                    ON notifications(recipient_id, delivered_at);
                "#,
        )
        .map_err(|e| Error::with_source("Failed to create SQLite schema", e))?;

        Ok(())
    }

    fn current_owner_status(
        conn: &Connection,
        id: BroadcastId,
    ) -> Result<Option<(UserId, BroadcastStatus)>> {
        Ok(conn
            .query_row(
                "SELECT owner_id, status FROM broadcasts WHERE id = ?1",
                params![id.0],
                |row| Ok((UserId(row.get(0)?), get_status(row, 1)?)),
            )
            .optional()?)
    }

    fn get_broadcast(conn: &Connection, id: BroadcastId) -> Result<Option<Broadcast>> {
        Ok(conn
            .query_row(
                &format!("SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE id = ?1"),
                params![id.0],
                broadcast_from_row,
            )
            .optional()?)
    }
}

#[async_trait]
impl BroadcastStore for SqliteStorage {
    async fn create_draft(&self, owner: UserId, title: &str, body: &str) -> Result<Broadcast> {
        let (title, body) = validate_draft(title, body)?;
        let conn = self.conn()?;
        let now = timestamp(Utc::now());

        conn.execute(
            r#"
                INSERT INTO broadcasts (owner_id, title, body, status, created_at, updated_at)
                VALUES (?1, ?2, ?3, 'draft', ?4, ?4)
                "#,
            params![owner.0, title, body, now],
        )?;

        let id = BroadcastId(conn.last_insert_rowid());
        Self::get_broadcast(&conn, id)?
            .ok_or_else(|| Error::other(format!("broadcast {id} vanished after insert")))
    }

    async fn get(&self, id: BroadcastId) -> Result<Option<Broadcast>> {
        let conn = self.conn()?;
        Self::get_broadcast(&conn, id)
    }

    async fn list_by_owner(
        &self,
        owner: UserId,
        filter: &BroadcastFilter,
    ) -> Result<Page<Broadcast>> {
        let conn = self.conn()?;
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM broadcasts WHERE owner_id = ?1 AND (?2 IS NULL OR status = ?2)",
            params![owner.0, status],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {BROADCAST_COLUMNS} FROM broadcasts
             WHERE owner_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3 OFFSET ?4"
        ))?;
        let items = stmt
            .query_map(
                params![owner.0, status, filter.per_page, filter.offset() as i64],
                broadcast_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Page {
            items,
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
        let conn = self.conn()?;
        let current = Self::get_broadcast(&conn, id)?.ok_or_else(|| DispatchError::not_found(id))?;
        if !current.is_owned_by(owner) {
            return Err(DispatchError::forbidden(id, owner).into());
        }

        let (title, body) = merge_update(&current, update)?;
        let changed = conn.execute(
            r#"
                UPDATE broadcasts SET title = ?3, body = ?4, updated_at = ?5
                WHERE id = ?1 AND owner_id = ?2 AND status = 'draft'
                "#,
            params![id.0, owner.0, title, body, timestamp(Utc::now())],
        )?;

        if changed == 0 {
            return Err(reject_begin(id, owner, Self::current_owner_status(&conn, id)?).into());
        }

        Self::get_broadcast(&conn, id)?.ok_or_else(|| DispatchError::not_found(id).into())
    }

    async fn delete_draft(&self, id: BroadcastId, owner: UserId) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM broadcasts WHERE id = ?1 AND owner_id = ?2 AND status = 'draft'",
            params![id.0, owner.0],
        )?;

        if changed == 0 {
            return Err(reject_begin(id, owner, Self::current_owner_status(&conn, id)?).into());
        }
        Ok(())
    }

    async fn try_begin_send(&self, id: BroadcastId, owner: UserId) -> Result<LeaseToken> {
        let conn = self.conn()?;
        let lease = LeaseToken::generate();
        let now = timestamp(Utc::now());

        let changed = conn.execute(
            r#"
                UPDATE broadcasts
                SET status = 'sending', lease_token = ?3, lease_acquired_at = ?4, updated_at = ?4
                WHERE id = ?1 AND owner_id = ?2 AND status = 'draft'
                "#,
            params![id.0, owner.0, lease.to_string(), now],
        )?;

        if changed == 1 {
            return Ok(lease);
        }

        Err(reject_begin(id, owner, Self::current_owner_status(&conn, id)?).into())
    }

    async fn finalize(
        &self,
        id: BroadcastId,
        lease: LeaseToken,
        outcome: DispatchOutcome,
    ) -> Result<BroadcastStatus> {
        let conn = self.conn()?;
        let status = outcome.final_status();
        let now = timestamp(Utc::now());

        let changed = conn.execute(
            r#"
                UPDATE broadcasts
                SET status = ?3,
                    updated_at = ?4,
                    sent_at = CASE WHEN ?3 = 'sent' THEN ?4 ELSE sent_at END
                WHERE id = ?1 AND lease_token = ?2 AND status = 'sending'
                "#,
            params![id.0, lease.to_string(), status.as_str(), now],
        )?;

        if changed == 1 {
            return Ok(status);
        }

        let current = conn
            .query_row(
                "SELECT status, lease_token FROM broadcasts WHERE id = ?1",
                params![id.0],
                |row| Ok((get_status(row, 0)?, get_lease(row, 1)?)),
            )
            .optional()?;
        resolve_finalize_miss(id, lease, current)
    }

    async fn expire_stale_leases(&self, older_than: Duration) -> Result<Vec<BroadcastId>> {
        let cutoff = timestamp(cutoff(older_than)?);
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            r#"
                UPDATE broadcasts
                SET status = 'failed', lease_token = NULL, updated_at = ?2
                WHERE status = 'sending'
                  AND (lease_acquired_at IS NULL OR lease_acquired_at <= ?1)
                RETURNING id
                "#,
        )?;
        let mut expired = stmt
            .query_map(params![cutoff, timestamp(Utc::now())], |row| {
                Ok(BroadcastId(row.get(0)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        expired.sort();

        Ok(expired)
    }
}

#[async_trait]
impl UserDirectory for SqliteStorage {
    async fn create_user(&self, username: &str, email: &str) -> Result<User> {
        let (username, email) = validate_user(username, email)?;
        let conn = self.conn()?;

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1 OR email = ?2)",
            params![username, email],
            |row| row.get(0),
        )?;
        if exists {
            return Err(DispatchError::validation(format!("user {username} already exists")).into());
        }

        conn.execute(
            "INSERT INTO users (username, email, active, created_at) VALUES (?1, ?2, 1, ?3)",
            params![username, email, timestamp(Utc::now())],
        )?;

        let id = conn.last_insert_rowid();
        Ok(conn.query_row(
            "SELECT id, username, email, active, created_at FROM users WHERE id = ?1",
            params![id],
            user_from_row,
        )?)
    }

    async fn deactivate_user(&self, id: UserId) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE users SET active = 0 WHERE id = ?1 AND active = 1",
            params![id.0],
        )?;
        Ok(changed > 0)
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, username, email, active, created_at FROM users ORDER BY id")?;
        let users = stmt
            .query_map([], user_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(users)
    }

    async fn active_user_ids(&self) -> Result<Vec<UserId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM users WHERE active = 1 ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| Ok(UserId(row.get(0)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    async fn known_user_ids(&self, ids: &[UserId]) -> Result<BTreeSet<UserId>> {
        const CHUNK_SIZE: usize = 500;

        if ids.is_empty() {
            return Ok(BTreeSet::new());
        }

        let conn = self.conn()?;
        let mut known = BTreeSet::new();

        for chunk in ids.chunks(CHUNK_SIZE) {
            let placeholders: String = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let query =
                format!("SELECT id FROM users WHERE active = 1 AND id IN ({placeholders})");
            let mut stmt = conn.prepare(&query)?;

            let params: Vec<&dyn rusqlite::ToSql> =
                chunk.iter().map(|id| &id.0 as &dyn rusqlite::ToSql).collect();
            let rows = stmt.query_map(params.as_slice(), |row| Ok(UserId(row.get(0)?)))?;
            for id in rows {
                known.insert(id?);
            }
        }

        Ok(known)
    }
}

#[async_trait]
impl NotificationWriter for SqliteStorage {
    async fn deliver(
        &self,
        broadcast_id: BroadcastId,
        recipient_id: UserId,
    ) -> std::result::Result<DeliveryStatus, WriteError> {
        let conn = self
            .conn()
            .map_err(|e| WriteError::write_failed(recipient_id, e.to_string()))?;

        let inserted = conn
            .execute(
                r#"
                    INSERT INTO notifications (broadcast_id, recipient_id, delivered_at, is_read)
                    VALUES (?1, ?2, ?3, 0)
                    ON CONFLICT (broadcast_id, recipient_id) DO NOTHING
                    "#,
                params![broadcast_id.0, recipient_id.0, timestamp(Utc::now())],
            )
            .map_err(|e| WriteError::write_failed(recipient_id, e.to_string()))?;

        Ok(if inserted == 1 {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::AlreadyDelivered
        })
    }
}

#[async_trait]
impl NotificationReader for SqliteStorage {
    async fn list_for_broadcast(&self, broadcast_id: BroadcastId) -> Result<Vec<Notification>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
             WHERE broadcast_id = ?1 ORDER BY recipient_id"
        ))?;
        let items = stmt
            .query_map(params![broadcast_id.0], notification_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    async fn list_for_recipient(
        &self,
        recipient_id: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<Page<Notification>> {
        let filter = BroadcastFilter::new(page, per_page);
        let conn = self.conn()?;

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1",
            params![recipient_id.0],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
             WHERE recipient_id = ?1
             ORDER BY delivered_at DESC, id DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let items = stmt
            .query_map(
                params![recipient_id.0, filter.per_page, filter.offset() as i64],
                notification_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total as u64,
            page: filter.page,
            per_page: filter.per_page,
        })
    }

    async fn mark_read(&self, notification_id: i64, recipient_id: UserId) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
                UPDATE notifications SET is_read = 1, read_at = ?3
                WHERE id = ?1 AND recipient_id = ?2 AND is_read = 0
                "#,
            params![notification_id, recipient_id.0, timestamp(Utc::now())],
        )?;
        Ok(changed > 0)
    }
}
