//! Storage driver contract: durable record storage, the concurrency-safe
//! claim operation, and the staged unit of work the emitter and processor
//! commit through.

use std::any::Any;
use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::OutboxResult;
use crate::record::OutboxRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOpKind {
    Persist,
    Remove,
}

/// A buffered business-entity write. The payload is opaque to the engine;
/// the driver committing the unit of work downcasts it to the entity
/// representation it understands and rejects anything else with
/// `UnsupportedEntity`.
pub struct EntityOp {
    pub kind: EntityOpKind,
    pub entity: Box<dyn Any + Send>,
}

impl EntityOp {
    pub fn persist(entity: impl Any + Send) -> Self {
        Self {
            kind: EntityOpKind::Persist,
            entity: Box::new(entity),
        }
    }

    pub fn remove(entity: impl Any + Send) -> Self {
        Self {
            kind: EntityOpKind::Remove,
            entity: Box::new(entity),
        }
    }
}

/// Result of one claim cycle.
///
/// `pending` records had their `attempt_at` extended and are to be
/// dispatched; `dead_lettered` records just exhausted their retry budget and
/// must be routed to the dead-letter hooks, never dispatched.
#[derive(Debug, Default)]
pub struct ClaimedBatch {
    pub pending: Vec<OutboxRecord>,
    pub dead_lettered: Vec<OutboxRecord>,
}

/// Staged writes committed in one storage transaction. Buffers are inert
/// until `commit`; dropping an uncommitted unit of work discards them.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Buffer a business-entity write. Fails fast with `UnsupportedEntity`
    /// when the payload is not a kind this driver can write.
    fn stage_entity(&mut self, op: EntityOp) -> OutboxResult<()>;

    /// Buffer the insert of a new outbox record.
    fn stage_insert_record(&mut self, record: OutboxRecord);

    /// Buffer a delivered-set update. Only `delivered_to_listeners` is
    /// written; `retry_count`, `attempt_at`, and `status` belong to the
    /// claim operation.
    fn stage_mark_delivered(&mut self, record_id: i64, delivered: BTreeSet<String>);

    /// Buffer the removal of a fully delivered record.
    fn stage_remove_record(&mut self, record_id: i64);

    /// Open one transaction, execute every staged write, commit. On failure
    /// everything rolls back. Returns the inserted records with their
    /// storage-assigned ids.
    async fn commit(self: Box<Self>) -> OutboxResult<Vec<OutboxRecord>>;
}

/// Pluggable persistence backend.
///
/// The claim algorithm is the contract's heart: select up to `limit` rows
/// with `status = pending` and `attempt_at <= now` under a row-level
/// exclusive lock (skip-locked where the backend supports it), increment
/// each row's `retry_count`, dead-letter rows that reached the event's
/// `max_retries` (`status = failed`, `attempt_at = null`), extend the rest
/// by the event's retry delay, persist, commit. Atomicity guarantees that
/// concurrent claimers never dispatch the same record twice in one window
/// and that a crash after claim merely leaves the record eligible again
/// after the extended deadline.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Pure factory: an unpersisted record with `retry_count = 0`,
    /// `status = pending`, an empty delivered set, and `inserted_at = now`.
    fn create_record(
        &self,
        event_name: &str,
        payload: Value,
        expire_at: i64,
        attempt_at: i64,
    ) -> OutboxRecord;

    fn unit_of_work(&self) -> Box<dyn UnitOfWork>;

    /// Atomically claim up to `limit` due records (see trait docs).
    /// `UnknownEvent` rolls the claim transaction back and propagates.
    async fn claim_due_batch(&self, limit: usize) -> OutboxResult<ClaimedBatch>;

    /// Snapshot of pending records, oldest first. No locking, no mutation.
    async fn find_pending(&self, limit: usize) -> OutboxResult<Vec<OutboxRecord>>;

    /// Retention sweep: delete records whose `expire_at` has elapsed,
    /// whatever their state. Administrative surface, never the hot path.
    async fn sweep_expired(&self, now_ms: i64) -> OutboxResult<u64>;

    /// Flip up to `limit` dead-lettered records back to `pending` with
    /// `retry_count = 0` and the given `attempt_at`. Administrative backfill.
    async fn requeue_failed(&self, limit: usize, attempt_at: i64) -> OutboxResult<u64>;
}
