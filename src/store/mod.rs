//! Persistence contract for the messaging engine.
//!
//! Two implementations conform to the same traits: [`memory::MemoryStore`]
//! (tests and single-node MVP deployments) and [`postgres::PgStore`]
//! (production). The backend is constructed exactly once at startup and
//! injected into the delivery engine; call sites never know which one they
//! are talking to.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{BlockState, DeliveryStatus, Message, NewMessage};

pub mod memory;
pub mod postgres;

/// Maximum number of ids a single batch mutation may carry. Callers chunk
/// larger requests; each chunk is all-or-nothing.
pub const BATCH_CAP: usize = 400;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("record not found")]
    NotFound,
}

/// Result of a per-user delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Only the requester's flag is set; the record survives for the other
    /// party.
    SoftDeleted,
    /// Both parties had deleted the message; it was physically removed.
    Purged,
}

/// Durable message log, partitioned by conversation id.
///
/// Implementations must keep an id -> conversation index maintained
/// atomically with every append so `get_by_id` never scans, and must apply
/// the read-time redaction policy inside `history` before records cross the
/// store boundary.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message: assigns id (UUIDv7), `created_at` and the
    /// initial `Sent` status. Atomic per message.
    async fn append(&self, msg: NewMessage) -> Result<Message, StoreError>;

    /// Point lookup through the id index.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Most recent `limit` messages between `a` and `b`, oldest-first,
    /// filtered and redacted for `viewer`.
    async fn history(
        &self,
        a: &str,
        b: &str,
        viewer: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Forward-only status transition. An equal-or-earlier target is a
    /// silent no-op; the current record is returned either way, `None` if
    /// the id is unknown.
    async fn advance_status(
        &self,
        id: Uuid,
        to: DeliveryStatus,
    ) -> Result<Option<Message>, StoreError>;

    /// Redact a message for all viewers. Unknown ids yield `None`.
    async fn revoke(&self, id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Batch revocation; all-or-nothing per call, unknown ids skipped.
    /// Callers must keep `ids.len() <= BATCH_CAP`.
    async fn revoke_many(&self, ids: &[Uuid]) -> Result<(), StoreError>;

    /// Flip `user`'s delete flag; purges the record when the counterpart
    /// flag was already set (smart delete). `None` when the id is unknown
    /// or `user` is not a participant.
    async fn set_deleted_for(
        &self,
        id: Uuid,
        user: &str,
    ) -> Result<Option<DeleteOutcome>, StoreError>;

    /// Batch per-user delete; all-or-nothing per call.
    async fn delete_many_for(&self, ids: &[Uuid], user: &str) -> Result<(), StoreError>;

    /// Advance every `Sent`/`Delivered` message from `sender` to `receiver`
    /// to `Read`; returns the number of messages touched.
    async fn mark_read_between(&self, sender: &str, receiver: &str) -> Result<u64, StoreError>;

    /// Connect-time sweep: advance every `Sent` message addressed to
    /// `receiver` to `Delivered` and return the updated records in append
    /// order.
    async fn take_undelivered(&self, receiver: &str) -> Result<Vec<Message>, StoreError>;

    /// Drop the whole pair partition.
    async fn clear_conversation(&self, a: &str, b: &str) -> Result<(), StoreError>;

    /// Physical removal outside the smart-delete path (conversation
    /// clearing uses `clear_conversation`; this exists for completeness of
    /// the contract and is only ever reached through the delete flags).
    async fn delete_physically(&self, id: Uuid) -> Result<(), StoreError>;
}

/// Symmetric block relation gating sends. Persisted per blocker.
#[async_trait]
pub trait BlockRegistry: Send + Sync {
    /// Flip the directed edge; returns the new state (true = now blocked).
    async fn toggle_block(&self, blocker: &str, blocked: &str) -> Result<bool, StoreError>;

    /// Symmetric OR of both directed edges.
    async fn is_blocked(&self, a: &str, b: &str) -> Result<bool, StoreError>;

    /// Directional disambiguation for UI purposes.
    async fn block_state(&self, me: &str, other: &str) -> Result<BlockState, StoreError>;
}
