//! Postgres store backend (sqlx).
//!
//! The `messages` primary key doubles as the id -> conversation index;
//! `(conversation_id, created_at)` serves history reads and
//! `(receiver, status)` the connect-time sweep. Smart delete runs inside a
//! single transaction so the flag flip and the physical removal cannot be
//! torn apart by a concurrent path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::conversation::ConversationId;
use crate::models::{BlockState, DeliveryStatus, Message, NewMessage, REVOKED_PLACEHOLDER};
use crate::store::{BlockRegistry, DeleteOutcome, MessageStore, StoreError};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Ranks statuses for monotonic SQL updates.
const STATUS_RANK: &str = "array_position(ARRAY['sent','delivered','read'], $2) \
     > array_position(ARRAY['sent','delivered','read'], status)";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(unavailable)?;
        MIGRATOR.run(&pool).await.map_err(unavailable)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn unavailable(e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn row_to_message(row: &PgRow) -> Message {
    let created_at: DateTime<Utc> = row.get("created_at");
    let status: String = row.get("status");
    let conversation_id: String = row.get("conversation_id");
    Message {
        id: row.get("id"),
        conversation_id: ConversationId::from_raw(conversation_id),
        sender: row.get("sender"),
        receiver: row.get("receiver"),
        body: row.get("body"),
        attachment_url: row.get("attachment_url"),
        attachment_kind: row.get("attachment_kind"),
        created_at,
        status: DeliveryStatus::parse(&status),
        revoked: row.get("revoked"),
        deleted_by_sender: row.get("deleted_by_sender"),
        deleted_by_receiver: row.get("deleted_by_receiver"),
    }
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender, receiver, body, attachment_url, \
     attachment_kind, created_at, status, revoked, deleted_by_sender, deleted_by_receiver";

#[async_trait]
impl MessageStore for PgStore {
    async fn append(&self, msg: NewMessage) -> Result<Message, StoreError> {
        let id = Uuid::now_v7();
        let conversation_id = msg.conversation_id();
        let row = sqlx::query(&format!(
            "INSERT INTO messages (id, conversation_id, sender, receiver, body, \
                 attachment_url, attachment_kind) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(id)
        .bind(conversation_id.as_str())
        .bind(&msg.sender)
        .bind(&msg.receiver)
        .bind(&msg.body)
        .bind(&msg.attachment_url)
        .bind(&msg.attachment_kind)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(row_to_message(&row))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(row.as_ref().map(row_to_message))
    }

    async fn history(
        &self,
        a: &str,
        b: &str,
        viewer: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let conversation_id = ConversationId::for_pair(a, b);
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM ( \
                 SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE conversation_id = $1 \
                 ORDER BY created_at DESC, id DESC LIMIT $2 \
             ) recent ORDER BY created_at ASC, id ASC"
        ))
        .bind(conversation_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(rows
            .iter()
            .map(row_to_message)
            .filter_map(|m| m.visible_to(viewer))
            .collect())
    }

    async fn advance_status(
        &self,
        id: Uuid,
        to: DeliveryStatus,
    ) -> Result<Option<Message>, StoreError> {
        let updated = sqlx::query(&format!(
            "UPDATE messages SET status = $2 WHERE id = $1 AND {STATUS_RANK} \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(id)
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        match updated {
            Some(row) => Ok(Some(row_to_message(&row))),
            // no-op transition or unknown id: report the current record
            None => self.get_by_id(id).await,
        }
    }

    async fn revoke(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE messages SET revoked = TRUE, body = $2, \
                 attachment_url = NULL, attachment_kind = NULL \
             WHERE id = $1 RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(id)
        .bind(REVOKED_PLACEHOLDER)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(row.as_ref().map(row_to_message))
    }

    async fn revoke_many(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE messages SET revoked = TRUE, body = $2, \
                 attachment_url = NULL, attachment_kind = NULL \
             WHERE id = ANY($1)",
        )
        .bind(ids)
        .bind(REVOKED_PLACEHOLDER)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn set_deleted_for(
        &self,
        id: Uuid,
        user: &str,
    ) -> Result<Option<DeleteOutcome>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let row = sqlx::query(
            "SELECT sender, receiver, deleted_by_sender, deleted_by_receiver \
             FROM messages WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let sender: String = row.get("sender");
        let receiver: String = row.get("receiver");
        let other_deleted = if user == sender {
            row.get::<bool, _>("deleted_by_receiver")
        } else if user == receiver {
            row.get::<bool, _>("deleted_by_sender")
        } else {
            return Ok(None);
        };

        let outcome = if other_deleted {
            sqlx::query("DELETE FROM messages WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
            DeleteOutcome::Purged
        } else {
            let column = if user == sender {
                "deleted_by_sender"
            } else {
                "deleted_by_receiver"
            };
            sqlx::query(&format!(
                "UPDATE messages SET {column} = TRUE WHERE id = $1"
            ))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
            DeleteOutcome::SoftDeleted
        };
        tx.commit().await.map_err(unavailable)?;
        Ok(Some(outcome))
    }

    async fn delete_many_for(&self, ids: &[Uuid], user: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        sqlx::query(
            "UPDATE messages SET deleted_by_sender = TRUE \
             WHERE id = ANY($1) AND sender = $2",
        )
        .bind(ids)
        .bind(user)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;
        sqlx::query(
            "UPDATE messages SET deleted_by_receiver = TRUE \
             WHERE id = ANY($1) AND receiver = $2",
        )
        .bind(ids)
        .bind(user)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;
        // smart delete for every message both parties have now removed
        sqlx::query(
            "DELETE FROM messages \
             WHERE id = ANY($1) AND deleted_by_sender AND deleted_by_receiver",
        )
        .bind(ids)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }

    async fn mark_read_between(&self, sender: &str, receiver: &str) -> Result<u64, StoreError> {
        let conversation_id = ConversationId::for_pair(sender, receiver);
        let result = sqlx::query(
            "UPDATE messages SET status = 'read' \
             WHERE conversation_id = $1 AND sender = $2 AND receiver = $3 \
               AND status <> 'read'",
        )
        .bind(conversation_id.as_str())
        .bind(sender)
        .bind(receiver)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(result.rows_affected())
    }

    async fn take_undelivered(&self, receiver: &str) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            "UPDATE messages SET status = 'delivered' \
             WHERE receiver = $1 AND status = 'sent' \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(receiver)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        let mut delivered: Vec<Message> = rows.iter().map(row_to_message).collect();
        delivered.sort_by_key(|m| m.id);
        Ok(delivered)
    }

    async fn clear_conversation(&self, a: &str, b: &str) -> Result<(), StoreError> {
        let conversation_id = ConversationId::for_pair(a, b);
        sqlx::query("DELETE FROM messages WHERE conversation_id = $1")
            .bind(conversation_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn delete_physically(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl BlockRegistry for PgStore {
    async fn toggle_block(&self, blocker: &str, blocked: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let removed = sqlx::query("DELETE FROM blocks WHERE blocker = $1 AND blocked = $2")
            .bind(blocker)
            .bind(blocked)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        let now_blocked = if removed.rows_affected() == 0 {
            sqlx::query("INSERT INTO blocks (blocker, blocked) VALUES ($1, $2)")
                .bind(blocker)
                .bind(blocked)
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
            true
        } else {
            false
        };
        tx.commit().await.map_err(unavailable)?;
        Ok(now_blocked)
    }

    async fn is_blocked(&self, a: &str, b: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS ( \
                 SELECT 1 FROM blocks \
                 WHERE (blocker = $1 AND blocked = $2) \
                    OR (blocker = $2 AND blocked = $1) \
             ) AS blocked",
        )
        .bind(a)
        .bind(b)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(row.get("blocked"))
    }

    async fn block_state(&self, me: &str, other: &str) -> Result<BlockState, StoreError> {
        let row = sqlx::query(
            "SELECT \
                 EXISTS (SELECT 1 FROM blocks WHERE blocker = $1 AND blocked = $2) AS by_me, \
                 EXISTS (SELECT 1 FROM blocks WHERE blocker = $2 AND blocked = $1) AS by_other",
        )
        .bind(me)
        .bind(other)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;
        if row.get::<bool, _>("by_me") {
            Ok(BlockState::BlockedByMe)
        } else if row.get::<bool, _>("by_other") {
            Ok(BlockState::BlockedByOther)
        } else {
            Ok(BlockState::None)
        }
    }
}
