//! Delivery engine: the orchestrator between the block gate, the message
//! store and the session registry.
//!
//! Mutating operations for one conversation are serialized behind a
//! per-conversation async mutex so a delivered-ack can never interleave with
//! a concurrent revoke on the same records; unrelated conversations proceed
//! concurrently. Failures never propagate past the engine: callers convert
//! the returned error into a targeted `error` event for the originating
//! session.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conversation::{personal_room, ConversationId};
use crate::error::{AppError, AppResult};
use crate::models::{BlockState, DeliveryStatus, Message, NewMessage};
use crate::store::{BlockRegistry, MessageStore, BATCH_CAP};
use crate::websocket::message_types::{MessagePayload, OutboundEvent};
use crate::websocket::SessionRegistry;

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub from: String,
    pub to: String,
    pub text: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_kind: Option<String>,
    pub client_temp_id: Option<String>,
}

pub struct DeliveryEngine {
    store: Arc<dyn MessageStore>,
    blocks: Arc<dyn BlockRegistry>,
    registry: SessionRegistry,
    locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
    history_limit: usize,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<dyn MessageStore>,
        blocks: Arc<dyn BlockRegistry>,
        registry: SessionRegistry,
        history_limit: usize,
    ) -> Self {
        Self {
            store,
            blocks,
            registry,
            locks: Mutex::new(HashMap::new()),
            history_limit,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Single-writer guard for one conversation.
    async fn conversation_lock(&self, id: &ConversationId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Accept a send: block gate, durable append, fan-out.
    ///
    /// The `message-received` event goes to the conversation room (excluding
    /// the sending connection) and to the receiver's personal room; a
    /// connection joined to both sees it twice and de-duplicates by id. The
    /// `send-confirmed` correlation goes to the sending connection only.
    pub async fn send(&self, conn: Option<Uuid>, req: SendRequest) -> AppResult<Message> {
        if req.from == req.to {
            return Err(AppError::InvalidRequest(
                "sender and receiver must differ".into(),
            ));
        }
        if req.text.is_none() && req.attachment_url.is_none() {
            return Err(AppError::InvalidRequest(
                "message needs a body or an attachment".into(),
            ));
        }
        if self.blocks.is_blocked(&req.from, &req.to).await? {
            debug!(from = %req.from, to = %req.to, "send rejected by block gate");
            return Err(AppError::Blocked);
        }

        let conversation_id = ConversationId::for_pair(&req.from, &req.to);
        let lock = self.conversation_lock(&conversation_id).await;
        let _guard = lock.lock().await;

        let message = self
            .store
            .append(NewMessage {
                sender: req.from.clone(),
                receiver: req.to.clone(),
                body: req.text,
                attachment_url: req.attachment_url,
                attachment_kind: req.attachment_kind,
            })
            .await?;
        info!(id = %message.id, conversation = %conversation_id, "message stored");

        let received = OutboundEvent::MessageReceived {
            message: MessagePayload::from(&message),
        };
        self.registry
            .broadcast(conversation_id.as_str(), &received, conn)
            .await;
        self.registry
            .broadcast(&personal_room(&req.to), &received, None)
            .await;

        if let Some(conn) = conn {
            self.registry
                .send_to_conn(
                    conn,
                    OutboundEvent::SendConfirmed {
                        client_temp_id: req.client_temp_id,
                        id: message.id,
                        timestamp: message.created_at,
                        status: message.status,
                    },
                )
                .await;
        }
        Ok(message)
    }

    /// Offline catch-up: advance every queued `sent` message addressed to
    /// `identity` to `delivered` and notify each original sender once, with
    /// the ids grouped per sender.
    pub async fn on_connect(&self, identity: &str) -> AppResult<()> {
        let delivered = self.store.take_undelivered(identity).await?;
        if delivered.is_empty() {
            return Ok(());
        }

        let mut by_sender: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
        for msg in &delivered {
            by_sender.entry(msg.sender.clone()).or_default().push(msg.id);
        }
        info!(
            user = %identity,
            messages = delivered.len(),
            senders = by_sender.len(),
            "offline catch-up sweep"
        );
        for (sender, ids) in by_sender {
            self.registry
                .broadcast(
                    &personal_room(&sender),
                    &OutboundEvent::BulkDelivered {
                        ids,
                        to: identity.to_string(),
                        status: DeliveryStatus::Delivered,
                    },
                    None,
                )
                .await;
        }
        Ok(())
    }

    /// Globally redact one message and tell the conversation room plus both
    /// participants' personal rooms. Unknown ids no-op. When a requester is
    /// given, only the original sender may revoke.
    pub async fn revoke(&self, id: Uuid, requester: Option<&str>) -> AppResult<()> {
        let Some(msg) = self.store.get_by_id(id).await? else {
            return Ok(());
        };
        if let Some(requester) = requester {
            if requester != msg.sender {
                return Err(AppError::InvalidRequest(
                    "only the sender can revoke a message".into(),
                ));
            }
        }
        let lock = self.conversation_lock(&msg.conversation_id).await;
        let _guard = lock.lock().await;

        self.store.revoke(id).await?;
        let event = OutboundEvent::MessageRevoked { id };
        self.registry
            .broadcast(msg.conversation_id.as_str(), &event, None)
            .await;
        self.registry
            .broadcast(&personal_room(&msg.sender), &event, None)
            .await;
        self.registry
            .broadcast(&personal_room(&msg.receiver), &event, None)
            .await;
        Ok(())
    }

    /// Batched revocation. All ids in one call are assumed to share a
    /// conversation; the broadcast targets come from the first resolvable
    /// message. Chunks of at most `BATCH_CAP` are applied all-or-nothing,
    /// and a failed chunk surfaces its index so the caller can resume.
    pub async fn bulk_revoke(&self, ids: &[Uuid], requester: Option<&str>) -> AppResult<()> {
        let Some(first) = self.first_known(ids).await? else {
            return Ok(());
        };
        if let Some(requester) = requester {
            if requester != first.sender {
                return Err(AppError::InvalidRequest(
                    "only the sender can revoke messages".into(),
                ));
            }
        }
        let lock = self.conversation_lock(&first.conversation_id).await;
        let _guard = lock.lock().await;

        for (chunk, batch) in ids.chunks(BATCH_CAP).enumerate() {
            self.store
                .revoke_many(batch)
                .await
                .map_err(|source| AppError::Batch { chunk, source })?;
        }

        let event = OutboundEvent::BulkMessageRevoked { ids: ids.to_vec() };
        self.registry
            .broadcast(first.conversation_id.as_str(), &event, None)
            .await;
        self.registry
            .broadcast(&personal_room(&first.sender), &event, None)
            .await;
        self.registry
            .broadcast(&personal_room(&first.receiver), &event, None)
            .await;
        Ok(())
    }

    /// Private per-user delete; only the requester's own sessions learn of
    /// it. Physical removal happens inside the store once both parties have
    /// deleted.
    pub async fn delete_for_user(&self, id: Uuid, requester: &str) -> AppResult<()> {
        let Some(msg) = self.store.get_by_id(id).await? else {
            return Ok(());
        };
        let lock = self.conversation_lock(&msg.conversation_id).await;
        let _guard = lock.lock().await;

        if self.store.set_deleted_for(id, requester).await?.is_some() {
            self.registry
                .broadcast(
                    &personal_room(requester),
                    &OutboundEvent::MessageDeleted { id },
                    None,
                )
                .await;
        } else {
            warn!(%id, user = %requester, "delete-for-me by non-participant ignored");
        }
        Ok(())
    }

    pub async fn bulk_delete_for_user(&self, ids: &[Uuid], requester: &str) -> AppResult<()> {
        let Some(first) = self.first_known(ids).await? else {
            return Ok(());
        };
        let lock = self.conversation_lock(&first.conversation_id).await;
        let _guard = lock.lock().await;

        for (chunk, batch) in ids.chunks(BATCH_CAP).enumerate() {
            self.store
                .delete_many_for(batch, requester)
                .await
                .map_err(|source| AppError::Batch { chunk, source })?;
        }
        self.registry
            .broadcast(
                &personal_room(requester),
                &OutboundEvent::BulkMessageDeleted { ids: ids.to_vec() },
                None,
            )
            .await;
        Ok(())
    }

    /// Read receipt for a whole conversation: one store sweep, one event.
    pub async fn mark_read(&self, sender: &str, receiver: &str) -> AppResult<()> {
        let conversation_id = ConversationId::for_pair(sender, receiver);
        let lock = self.conversation_lock(&conversation_id).await;
        let _guard = lock.lock().await;

        let count = self.store.mark_read_between(sender, receiver).await?;
        debug!(conversation = %conversation_id, count, "marked read");
        self.registry
            .broadcast(
                conversation_id.as_str(),
                &OutboundEvent::MessagesRead {
                    by: receiver.to_string(),
                    read_all_from: sender.to_string(),
                },
                None,
            )
            .await;
        Ok(())
    }

    /// Explicit single-message delivery receipt (the bulk path is
    /// `on_connect`). Idempotent: a repeat ack leaves the status unchanged.
    pub async fn mark_delivered(&self, id: Uuid, sender: &str, receiver: &str) -> AppResult<()> {
        let conversation_id = ConversationId::for_pair(sender, receiver);
        let lock = self.conversation_lock(&conversation_id).await;
        let _guard = lock.lock().await;

        if let Some(msg) = self
            .store
            .advance_status(id, DeliveryStatus::Delivered)
            .await?
        {
            self.registry
                .broadcast(
                    conversation_id.as_str(),
                    &OutboundEvent::MessageDelivered {
                        id,
                        status: msg.status,
                    },
                    None,
                )
                .await;
        }
        Ok(())
    }

    /// Fire-and-forget typing indicator to the recipient's personal room.
    pub async fn typing(&self, conn: Option<Uuid>, from: &str, to: &str, typing: bool) {
        self.registry
            .broadcast(
                &personal_room(to),
                &OutboundEvent::UserTyping {
                    from: from.to_string(),
                    typing,
                },
                conn,
            )
            .await;
    }

    /// Filtered, redacted history for `viewer`.
    pub async fn history(&self, a: &str, b: &str, viewer: &str) -> AppResult<Vec<Message>> {
        Ok(self.store.history(a, b, viewer, self.history_limit).await?)
    }

    /// Drop the whole conversation between `requester` and `other`.
    pub async fn clear_conversation(&self, requester: &str, other: &str) -> AppResult<()> {
        let conversation_id = ConversationId::for_pair(requester, other);
        let lock = self.conversation_lock(&conversation_id).await;
        let _guard = lock.lock().await;
        self.store.clear_conversation(requester, other).await?;
        info!(conversation = %conversation_id, "conversation cleared");
        Ok(())
    }

    pub async fn toggle_block(&self, blocker: &str, blocked: &str) -> AppResult<bool> {
        Ok(self.blocks.toggle_block(blocker, blocked).await?)
    }

    pub async fn block_state(&self, me: &str, other: &str) -> AppResult<BlockState> {
        Ok(self.blocks.block_state(me, other).await?)
    }

    /// First message in `ids` that still exists; batch callers resolve
    /// broadcast targets from it.
    async fn first_known(&self, ids: &[Uuid]) -> AppResult<Option<Message>> {
        for &id in ids {
            if let Some(msg) = self.store.get_by_id(id).await? {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }
}
