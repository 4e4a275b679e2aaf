use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, order-independent identifier for a 1:1 conversation.
///
/// Derived from the two participant identities: each identity is escaped so
/// it cannot contain the join separator, the escaped forms are sorted
/// lexicographically and joined with `|`. The same value doubles as the
/// partition key in the store and as the broadcast room name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

const SEPARATOR: char = '|';

/// Reversible escape: `%` -> `%25`, `/` -> `%2F`, `|` -> `%7C`.
///
/// `/` is escaped because the id is used as a hierarchical storage path by
/// path-keyed backends; `|` so the separator can never appear inside an
/// escaped identity. Escaping `%` itself keeps the mapping collision-free.
fn escape(identity: &str) -> String {
    let mut out = String::with_capacity(identity.len());
    for c in identity.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '|' => out.push_str("%7C"),
            _ => out.push(c),
        }
    }
    out
}

impl ConversationId {
    /// Derive the conversation id for a pair of identities.
    ///
    /// Pure and infallible; `for_pair(a, b) == for_pair(b, a)`.
    pub fn for_pair(a: &str, b: &str) -> Self {
        let mut pair = [escape(a), escape(b)];
        pair.sort();
        let [lo, hi] = pair;
        Self(format!("{lo}{SEPARATOR}{hi}"))
    }

    /// Wrap an already-derived id as read back from a store.
    pub(crate) fn from_raw(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `identity` is one of the two participants encoded in this id.
    pub fn involves(&self, identity: &str) -> bool {
        let escaped = escape(identity);
        self.0.split(SEPARATOR).any(|part| part == escaped)
    }
}

/// Broadcast room name for one identity's own sessions.
///
/// The escaped form never contains the separator, so a personal room can
/// never share a name with any conversation room, whatever the identity
/// looks like.
pub fn personal_room(identity: &str) -> String {
    escape(identity)
}

/// Whether `identity` may subscribe to `room`: their own personal room, or
/// a conversation room they participate in.
pub fn room_involves(room: &str, identity: &str) -> bool {
    if room == identity {
        return true;
    }
    let escaped = escape(identity);
    room.contains(SEPARATOR) && room.split(SEPARATOR).any(|part| part == escaped)
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> String {
        id.0
    }
}
