use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use uuid::Uuid;

pub mod handlers;
pub mod message_types;

use message_types::OutboundEvent;

/// Maps room names to the live connections subscribed to them.
///
/// A room is either an identity's personal room (every connection of that
/// user, named by the escaped identity so it can never collide with a
/// conversation room) or a conversation room. Rooms hold no queue: an event
/// broadcast to an empty room is dropped, and offline delivery is the
/// store's job via the `sent` status.
#[derive(Default, Clone)]
pub struct SessionRegistry {
    // room name -> subscribed connections
    rooms: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
    // connection id -> direct channel (for targeted sends)
    conns: Arc<RwLock<HashMap<Uuid, UnboundedSender<OutboundEvent>>>>,
}

#[derive(Clone)]
pub struct Subscriber {
    pub conn_id: Uuid,
    pub tx: UnboundedSender<OutboundEvent>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection; returns its id and the event receiver.
    pub async fn connect(&self) -> (Uuid, UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = unbounded_channel();
        let conn_id = Uuid::new_v4();
        self.conns.write().await.insert(conn_id, tx);
        (conn_id, rx)
    }

    /// Add a connection to a room. Idempotent per connection.
    pub async fn join(&self, room: &str, conn_id: Uuid) {
        let Some(tx) = self.conns.read().await.get(&conn_id).cloned() else {
            return;
        };
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room.to_string()).or_default();
        if !members.iter().any(|s| s.conn_id == conn_id) {
            members.push(Subscriber { conn_id, tx });
        }
    }

    /// Deliver `event` to every live connection in `room`, pruning dead
    /// senders as it goes. Empty rooms drop the event.
    pub async fn broadcast(&self, room: &str, event: &OutboundEvent, exclude: Option<Uuid>) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room) {
            members.retain(|s| {
                if Some(s.conn_id) == exclude {
                    return true;
                }
                s.tx.send(event.clone()).is_ok()
            });
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Targeted send to one connection.
    pub async fn send_to_conn(&self, conn_id: Uuid, event: OutboundEvent) {
        if let Some(tx) = self.conns.read().await.get(&conn_id) {
            let _ = tx.send(event);
        }
    }

    /// Drop a connection from every room on disconnect.
    pub async fn remove_connection(&self, conn_id: Uuid) {
        self.conns.write().await.remove(&conn_id);
        let mut rooms = self.rooms.write().await;
        rooms.retain(|_, members| {
            members.retain(|s| s.conn_id != conn_id);
            !members.is_empty()
        });
    }

    #[cfg(test)]
    pub async fn room_size(&self, room: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}
