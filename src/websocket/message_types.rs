//! Wire-level event types.
//!
//! Both directions use internally-tagged JSON (`{"type": "...", ...}`).
//! Inbound events carry the identities the client claims to act as; the
//! socket handler checks them against the connection's authenticated
//! identity before anything reaches the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{DeliveryStatus, Message};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsInboundEvent {
    /// Join a broadcast room (a conversation room; the personal room is
    /// joined automatically on connect).
    Join { room: String },
    Send {
        from: String,
        to: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        attachment_url: Option<String>,
        #[serde(default)]
        attachment_kind: Option<String>,
        #[serde(default)]
        client_temp_id: Option<String>,
    },
    Revoke { id: Uuid },
    BulkRevoke { ids: Vec<Uuid> },
    DeleteForMe { id: Uuid, user_id: String },
    BulkDeleteForMe { ids: Vec<Uuid>, user_id: String },
    MarkRead { sender: String, receiver: String },
    MarkDelivered {
        msg_id: Uuid,
        sender: String,
        receiver: String,
    },
    Typing {
        from: String,
        to: String,
        typing: bool,
    },
}

/// Message as it crosses the wire, field names matching the client contract.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePayload {
    pub id: Uuid,
    pub from: String,
    pub to: String,
    pub text: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_kind: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl From<&Message> for MessagePayload {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id,
            from: msg.sender.clone(),
            to: msg.receiver.clone(),
            text: msg.body.clone(),
            attachment_url: msg.attachment_url.clone(),
            attachment_kind: msg.attachment_kind.clone(),
            timestamp: msg.created_at,
            status: msg.status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    /// Fanned out to the conversation room and the receiver's personal room;
    /// the same connection may legitimately see it twice (at-least-once),
    /// clients de-duplicate by `id`.
    #[serde(rename = "message-received")]
    MessageReceived {
        #[serde(flatten)]
        message: MessagePayload,
    },

    /// To the sending connection only; correlates the client's provisional
    /// id with the durable one.
    #[serde(rename = "send-confirmed")]
    SendConfirmed {
        client_temp_id: Option<String>,
        id: Uuid,
        timestamp: DateTime<Utc>,
        status: DeliveryStatus,
    },

    /// One per distinct original sender after a connect-time sweep; `to` is
    /// the receiver whose device came online.
    #[serde(rename = "bulk-delivered")]
    BulkDelivered {
        ids: Vec<Uuid>,
        to: String,
        status: DeliveryStatus,
    },

    #[serde(rename = "message-revoked")]
    MessageRevoked { id: Uuid },

    #[serde(rename = "bulk-message-revoked")]
    BulkMessageRevoked { ids: Vec<Uuid> },

    #[serde(rename = "message-deleted")]
    MessageDeleted { id: Uuid },

    #[serde(rename = "bulk-message-deleted")]
    BulkMessageDeleted { ids: Vec<Uuid> },

    #[serde(rename = "messages-read")]
    MessagesRead { by: String, read_all_from: String },

    #[serde(rename = "message-delivered")]
    MessageDelivered { id: Uuid, status: DeliveryStatus },

    #[serde(rename = "user-typing")]
    UserTyping { from: String, typing: bool },

    #[serde(rename = "error")]
    Error { message: String },
}

impl OutboundEvent {
    pub fn to_json(&self) -> String {
        // enum of plain fields; serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"error\"}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_send_parses_with_optional_fields() {
        let evt: WsInboundEvent = serde_json::from_str(
            r#"{"type":"send","from":"a","to":"b","text":"hi","client_temp_id":"tmp-1"}"#,
        )
        .unwrap();
        match evt {
            WsInboundEvent::Send {
                from,
                to,
                text,
                client_temp_id,
                ..
            } => {
                assert_eq!(from, "a");
                assert_eq!(to, "b");
                assert_eq!(text.as_deref(), Some("hi"));
                assert_eq!(client_temp_id.as_deref(), Some("tmp-1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn outbound_events_are_tagged() {
        let evt = OutboundEvent::MessagesRead {
            by: "b".into(),
            read_all_from: "a".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&evt.to_json()).unwrap();
        assert_eq!(value["type"], "messages-read");
        assert_eq!(value["by"], "b");
    }

    #[test]
    fn message_received_flattens_payload() {
        let evt = OutboundEvent::MessageReceived {
            message: MessagePayload {
                id: Uuid::now_v7(),
                from: "a".into(),
                to: "b".into(),
                text: Some("hi".into()),
                attachment_url: None,
                attachment_kind: None,
                timestamp: Utc::now(),
                status: DeliveryStatus::Sent,
            },
        };
        let value: serde_json::Value = serde_json::from_str(&evt.to_json()).unwrap();
        assert_eq!(value["type"], "message-received");
        assert_eq!(value["from"], "a");
        assert_eq!(value["status"], "sent");
    }
}
