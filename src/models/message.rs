use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::ConversationId;

/// Placeholder substituted for the content of a revoked message.
pub const REVOKED_PLACEHOLDER: &str = "This message was deleted";

/// Delivery status of a message.
///
/// Transitions are forward-only: `Sent -> Delivered -> Read`. The `Ord`
/// derive encodes the ordering; a request to move to an equal-or-earlier
/// state is a silent no-op, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "read" => DeliveryStatus::Read,
            "delivered" => DeliveryStatus::Delivered,
            _ => DeliveryStatus::Sent,
        }
    }
}

/// A persisted 1:1 message.
///
/// `revoked` and the two `deleted_by_*` flags are orthogonal to `status`:
/// revocation redacts content for everyone, per-user deletion hides the
/// record from one party only. Once both deletion flags are set the record
/// is physically purged (smart delete) and can never be read again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub sender: String,
    pub receiver: String,
    pub body: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_kind: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub revoked: bool,
    pub deleted_by_sender: bool,
    pub deleted_by_receiver: bool,
}

impl Message {
    /// Clear content fields, leaving identity, participants and status intact.
    pub fn redact(&mut self) {
        self.revoked = true;
        self.body = Some(REVOKED_PLACEHOLDER.to_string());
        self.attachment_url = None;
        self.attachment_kind = None;
    }

    /// Whether `viewer` has privately deleted this message.
    pub fn hidden_from(&self, viewer: &str) -> bool {
        (self.deleted_by_sender && viewer == self.sender)
            || (self.deleted_by_receiver && viewer == self.receiver)
    }

    /// Read-time redaction policy: `None` when the viewer deleted the
    /// message, a placeholder-bodied copy when it was revoked, the record
    /// as-is otherwise.
    pub fn visible_to(&self, viewer: &str) -> Option<Message> {
        if self.hidden_from(viewer) {
            return None;
        }
        let mut msg = self.clone();
        if msg.revoked {
            msg.redact();
        }
        Some(msg)
    }
}

/// Input to `MessageStore::append`. The store assigns id, timestamp and the
/// initial `Sent` status.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: String,
    pub receiver: String,
    pub body: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_kind: Option<String>,
}

impl NewMessage {
    pub fn conversation_id(&self) -> ConversationId {
        ConversationId::for_pair(&self.sender, &self.receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message {
            id: Uuid::now_v7(),
            conversation_id: ConversationId::for_pair("a", "b"),
            sender: "a".into(),
            receiver: "b".into(),
            body: Some("hi".into()),
            attachment_url: None,
            attachment_kind: None,
            created_at: Utc::now(),
            status: DeliveryStatus::Sent,
            revoked: false,
            deleted_by_sender: false,
            deleted_by_receiver: false,
        }
    }

    #[test]
    fn status_ordering_is_forward_only() {
        assert!(DeliveryStatus::Sent < DeliveryStatus::Delivered);
        assert!(DeliveryStatus::Delivered < DeliveryStatus::Read);
    }

    #[test]
    fn redaction_preserves_identity_and_status() {
        let mut msg = sample();
        msg.status = DeliveryStatus::Read;
        msg.redact();
        assert_eq!(msg.body.as_deref(), Some(REVOKED_PLACEHOLDER));
        assert!(msg.attachment_url.is_none());
        assert_eq!(msg.status, DeliveryStatus::Read);
        assert_eq!(msg.sender, "a");
    }

    #[test]
    fn deleted_by_sender_hides_from_sender_only() {
        let mut msg = sample();
        msg.deleted_by_sender = true;
        assert!(msg.visible_to("a").is_none());
        let for_b = msg.visible_to("b").unwrap();
        assert_eq!(for_b.body.as_deref(), Some("hi"));
    }

    #[test]
    fn revoked_message_shows_placeholder_to_everyone() {
        let mut msg = sample();
        msg.revoked = true;
        for viewer in ["a", "b"] {
            let seen = msg.visible_to(viewer).unwrap();
            assert_eq!(seen.body.as_deref(), Some(REVOKED_PLACEHOLDER));
            assert_eq!(seen.id, msg.id);
        }
    }
}
