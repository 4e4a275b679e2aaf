//! In-memory store backend.
//!
//! Pair partitions are `BTreeMap`s keyed by UUIDv7 message ids, so iteration
//! order is append order. A separate id -> conversation map serves point
//! lookups, and a per-receiver set of still-`Sent` ids makes the connect
//! sweep exact without scanning partitions.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::conversation::ConversationId;
use crate::models::{BlockState, DeliveryStatus, Message, NewMessage};
use crate::store::{BlockRegistry, DeleteOutcome, MessageStore, StoreError};

#[derive(Default)]
struct Inner {
    conversations: HashMap<ConversationId, BTreeMap<Uuid, Message>>,
    message_index: HashMap<Uuid, ConversationId>,
    undelivered: HashMap<String, BTreeSet<Uuid>>,
    blocks: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn get_mut(&mut self, id: Uuid) -> Option<&mut Message> {
        let conversation_id = self.message_index.get(&id)?.clone();
        self.conversations.get_mut(&conversation_id)?.get_mut(&id)
    }

    fn drop_undelivered(&mut self, receiver: &str, id: Uuid) {
        if let Some(set) = self.undelivered.get_mut(receiver) {
            set.remove(&id);
            if set.is_empty() {
                self.undelivered.remove(receiver);
            }
        }
    }

    fn purge(&mut self, id: Uuid) {
        if let Some(conversation_id) = self.message_index.remove(&id) {
            let receiver = self
                .conversations
                .get_mut(&conversation_id)
                .and_then(|msgs| msgs.remove(&id))
                .map(|msg| msg.receiver);
            if let Some(receiver) = receiver {
                self.drop_undelivered(&receiver, id);
            }
        }
    }

    /// Flip the delete flag for `user`; purge when both flags end up set.
    fn delete_for(&mut self, id: Uuid, user: &str) -> Option<DeleteOutcome> {
        let msg = self.get_mut(id)?;
        if user == msg.sender {
            msg.deleted_by_sender = true;
        } else if user == msg.receiver {
            msg.deleted_by_receiver = true;
        } else {
            return None;
        }
        if msg.deleted_by_sender && msg.deleted_by_receiver {
            self.purge(id);
            Some(DeleteOutcome::Purged)
        } else {
            Some(DeleteOutcome::SoftDeleted)
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, msg: NewMessage) -> Result<Message, StoreError> {
        let conversation_id = msg.conversation_id();
        let record = Message {
            id: Uuid::now_v7(),
            conversation_id: conversation_id.clone(),
            sender: msg.sender,
            receiver: msg.receiver,
            body: msg.body,
            attachment_url: msg.attachment_url,
            attachment_kind: msg.attachment_kind,
            created_at: Utc::now(),
            status: DeliveryStatus::Sent,
            revoked: false,
            deleted_by_sender: false,
            deleted_by_receiver: false,
        };

        let mut inner = self.inner.write().await;
        inner
            .message_index
            .insert(record.id, conversation_id.clone());
        inner
            .undelivered
            .entry(record.receiver.clone())
            .or_default()
            .insert(record.id);
        inner
            .conversations
            .entry(conversation_id)
            .or_default()
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.read().await;
        let Some(conversation_id) = inner.message_index.get(&id) else {
            return Ok(None);
        };
        Ok(inner
            .conversations
            .get(conversation_id)
            .and_then(|msgs| msgs.get(&id))
            .cloned())
    }

    async fn history(
        &self,
        a: &str,
        b: &str,
        viewer: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let conversation_id = ConversationId::for_pair(a, b);
        let inner = self.inner.read().await;
        let Some(msgs) = inner.conversations.get(&conversation_id) else {
            return Ok(Vec::new());
        };
        // most recent `limit` records first, then the viewer filter, so a
        // message the viewer deleted still counts against the window
        let mut recent: Vec<Message> = msgs
            .values()
            .rev()
            .take(limit)
            .filter_map(|m| m.visible_to(viewer))
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn advance_status(
        &self,
        id: Uuid,
        to: DeliveryStatus,
    ) -> Result<Option<Message>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(msg) = inner.get_mut(id) else {
            return Ok(None);
        };
        let receiver = msg.receiver.clone();
        if to > msg.status {
            let was_sent = msg.status == DeliveryStatus::Sent;
            msg.status = to;
            let snapshot = msg.clone();
            if was_sent {
                inner.drop_undelivered(&receiver, id);
            }
            Ok(Some(snapshot))
        } else {
            Ok(Some(msg.clone()))
        }
    }

    async fn revoke(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(msg) = inner.get_mut(id) else {
            return Ok(None);
        };
        msg.redact();
        Ok(Some(msg.clone()))
    }

    async fn revoke_many(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        // single write lock: the whole batch lands or none of it does
        let mut inner = self.inner.write().await;
        for &id in ids {
            if let Some(msg) = inner.get_mut(id) {
                msg.redact();
            }
        }
        Ok(())
    }

    async fn set_deleted_for(
        &self,
        id: Uuid,
        user: &str,
    ) -> Result<Option<DeleteOutcome>, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.delete_for(id, user))
    }

    async fn delete_many_for(&self, ids: &[Uuid], user: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for &id in ids {
            inner.delete_for(id, user);
        }
        Ok(())
    }

    async fn mark_read_between(&self, sender: &str, receiver: &str) -> Result<u64, StoreError> {
        let conversation_id = ConversationId::for_pair(sender, receiver);
        let mut inner = self.inner.write().await;
        let Some(msgs) = inner.conversations.get_mut(&conversation_id) else {
            return Ok(0);
        };
        let mut advanced = 0u64;
        let mut was_undelivered = Vec::new();
        for msg in msgs.values_mut() {
            if msg.sender == sender && msg.receiver == receiver && msg.status < DeliveryStatus::Read
            {
                if msg.status == DeliveryStatus::Sent {
                    was_undelivered.push(msg.id);
                }
                msg.status = DeliveryStatus::Read;
                advanced += 1;
            }
        }
        for id in was_undelivered {
            inner.drop_undelivered(receiver, id);
        }
        Ok(advanced)
    }

    async fn take_undelivered(&self, receiver: &str) -> Result<Vec<Message>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(ids) = inner.undelivered.remove(receiver) else {
            return Ok(Vec::new());
        };
        let mut delivered = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(msg) = inner.get_mut(id) {
                if msg.status == DeliveryStatus::Sent {
                    msg.status = DeliveryStatus::Delivered;
                }
                delivered.push(msg.clone());
            }
        }
        Ok(delivered)
    }

    async fn clear_conversation(&self, a: &str, b: &str) -> Result<(), StoreError> {
        let conversation_id = ConversationId::for_pair(a, b);
        let mut inner = self.inner.write().await;
        if let Some(msgs) = inner.conversations.remove(&conversation_id) {
            for (id, msg) in msgs {
                inner.message_index.remove(&id);
                inner.drop_undelivered(&msg.receiver, id);
            }
        }
        Ok(())
    }

    async fn delete_physically(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.purge(id);
        Ok(())
    }
}

#[async_trait]
impl BlockRegistry for MemoryStore {
    async fn toggle_block(&self, blocker: &str, blocked: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let edges = inner.blocks.entry(blocker.to_string()).or_default();
        if edges.remove(blocked) {
            Ok(false)
        } else {
            edges.insert(blocked.to_string());
            Ok(true)
        }
    }

    async fn is_blocked(&self, a: &str, b: &str) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        let forward = inner.blocks.get(a).is_some_and(|set| set.contains(b));
        let reverse = inner.blocks.get(b).is_some_and(|set| set.contains(a));
        Ok(forward || reverse)
    }

    async fn block_state(&self, me: &str, other: &str) -> Result<BlockState, StoreError> {
        let inner = self.inner.read().await;
        if inner.blocks.get(me).is_some_and(|set| set.contains(other)) {
            Ok(BlockState::BlockedByMe)
        } else if inner.blocks.get(other).is_some_and(|set| set.contains(me)) {
            Ok(BlockState::BlockedByOther)
        } else {
            Ok(BlockState::None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(from: &str, to: &str, body: &str) -> NewMessage {
        NewMessage {
            sender: from.into(),
            receiver: to.into(),
            body: Some(body.into()),
            attachment_url: None,
            attachment_kind: None,
        }
    }

    #[tokio::test]
    async fn append_assigns_sent_status_and_orderable_ids() {
        let store = MemoryStore::new();
        let first = store.append(text("a", "b", "one")).await.unwrap();
        let second = store.append(text("a", "b", "two")).await.unwrap();
        assert_eq!(first.status, DeliveryStatus::Sent);
        assert!(second.id > first.id);

        let history = store.history("b", "a", "b", 100).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].body.as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn status_never_regresses() {
        let store = MemoryStore::new();
        let msg = store.append(text("a", "b", "hi")).await.unwrap();
        store
            .advance_status(msg.id, DeliveryStatus::Read)
            .await
            .unwrap();
        let after = store
            .advance_status(msg.id, DeliveryStatus::Delivered)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn smart_delete_purges_after_both_parties() {
        let store = MemoryStore::new();
        let msg = store.append(text("a", "b", "hi")).await.unwrap();

        let first = store.set_deleted_for(msg.id, "a").await.unwrap();
        assert_eq!(first, Some(DeleteOutcome::SoftDeleted));
        // record still present, hidden from a, visible to b
        let record = store.get_by_id(msg.id).await.unwrap().unwrap();
        assert!(record.visible_to("a").is_none());
        assert!(record.visible_to("b").is_some());

        let second = store.set_deleted_for(msg.id, "b").await.unwrap();
        assert_eq!(second, Some(DeleteOutcome::Purged));
        assert!(store.get_by_id(msg.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn take_undelivered_is_exact_and_one_shot() {
        let store = MemoryStore::new();
        let m1 = store.append(text("a", "b", "one")).await.unwrap();
        store.append(text("a", "c", "other")).await.unwrap();

        let swept = store.take_undelivered("b").await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, m1.id);
        assert_eq!(swept[0].status, DeliveryStatus::Delivered);

        assert!(store.take_undelivered("b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_window_counts_hidden_messages() {
        let store = MemoryStore::new();
        store.append(text("a", "b", "old")).await.unwrap();
        let newest = store.append(text("a", "b", "new")).await.unwrap();
        store.set_deleted_for(newest.id, "b").await.unwrap();

        // the newest record fills the window even though b deleted it
        assert!(store.history("a", "b", "b", 1).await.unwrap().is_empty());
        let for_a = store.history("a", "b", "a", 1).await.unwrap();
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].id, newest.id);
    }

    #[tokio::test]
    async fn block_toggle_and_symmetry() {
        let store = MemoryStore::new();
        assert!(store.toggle_block("a", "b").await.unwrap());
        assert!(store.is_blocked("a", "b").await.unwrap());
        assert!(store.is_blocked("b", "a").await.unwrap());
        assert_eq!(
            store.block_state("b", "a").await.unwrap(),
            BlockState::BlockedByOther
        );
        assert!(!store.toggle_block("a", "b").await.unwrap());
        assert!(!store.is_blocked("a", "b").await.unwrap());
    }

    #[tokio::test]
    async fn clear_conversation_drops_partition_and_indexes() {
        let store = MemoryStore::new();
        let msg = store.append(text("a", "b", "hi")).await.unwrap();
        store.clear_conversation("a", "b").await.unwrap();
        assert!(store.get_by_id(msg.id).await.unwrap().is_none());
        assert!(store.take_undelivered("b").await.unwrap().is_empty());
    }
}
