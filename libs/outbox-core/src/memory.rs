//! In-process reference driver.
//!
//! A complete `StorageDriver` over a single mutex, which makes the claim
//! algorithm trivially atomic. The test suite runs on it; it also serves
//! embedders that want outbox semantics without a database, at the cost of
//! durability.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::EventConfigRegistry;
use crate::driver::{ClaimedBatch, EntityOp, EntityOpKind, StorageDriver, UnitOfWork};
use crate::error::{OutboxError, OutboxResult};
use crate::record::{OutboxRecord, OutboxStatus};

/// Business entity the memory driver can write: a JSON document under a
/// (collection, key) address.
#[derive(Debug, Clone)]
pub struct MemoryEntity {
    pub collection: String,
    pub key: String,
    pub value: Value,
}

impl MemoryEntity {
    pub fn new(collection: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            value,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<i64, OutboxRecord>,
    entities: HashMap<(String, String), Value>,
}

struct MemoryInner {
    state: Mutex<MemoryState>,
    next_id: AtomicI64,
    registry: Arc<EventConfigRegistry>,
    clock: SharedClock,
    fail_commits: AtomicBool,
}

/// Cloning shares the underlying store, so several components (or several
/// pollers in a concurrency test) can target the same table.
#[derive(Clone)]
pub struct MemoryDriver {
    inner: Arc<MemoryInner>,
}

impl MemoryDriver {
    pub fn new(registry: Arc<EventConfigRegistry>, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState::default()),
                next_id: AtomicI64::new(1),
                registry,
                clock,
                fail_commits: AtomicBool::new(false),
            }),
        }
    }

    /// Make every subsequent `commit` fail without applying anything.
    /// Fault-injection hook for tests.
    pub fn set_fail_commits(&self, fail: bool) {
        self.inner.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn record(&self, id: i64) -> Option<OutboxRecord> {
        self.inner.state.lock().records.get(&id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.inner.state.lock().records.len()
    }

    pub fn entity(&self, collection: &str, key: &str) -> Option<Value> {
        self.inner
            .state
            .lock()
            .entities
            .get(&(collection.to_string(), key.to_string()))
            .cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.inner.state.lock().entities.len()
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    fn create_record(
        &self,
        event_name: &str,
        payload: Value,
        expire_at: i64,
        attempt_at: i64,
    ) -> OutboxRecord {
        OutboxRecord::new(
            event_name,
            payload,
            expire_at,
            attempt_at,
            self.inner.clock.now_ms(),
        )
    }

    fn unit_of_work(&self) -> Box<dyn UnitOfWork> {
        Box::new(MemoryUnitOfWork {
            inner: Arc::clone(&self.inner),
            staged: Vec::new(),
        })
    }

    async fn claim_due_batch(&self, limit: usize) -> OutboxResult<ClaimedBatch> {
        let now = self.inner.clock.now_ms();
        let mut state = self.inner.state.lock();

        // Oldest deadline first, ties by id; mirrors the SQL claim ordering.
        let mut due: Vec<(i64, i64)> = state
            .records
            .values()
            .filter(|record| record.is_due(now))
            .map(|record| (record.attempt_at.unwrap_or(i64::MAX), record.id))
            .collect();
        due.sort_unstable();
        due.truncate(limit);

        // Resolve every configuration before mutating anything, so an
        // unknown event leaves the batch untouched (transaction rollback).
        let mut updates = Vec::with_capacity(due.len());
        for (_, id) in &due {
            let record = &state.records[id];
            let config = self.inner.registry.resolve(&record.event_name)?;
            let retry_count = record.retry_count + 1;
            if retry_count >= config.max_retries {
                updates.push((*id, retry_count, None));
            } else {
                let delay_ms = config.retry_delay(retry_count).as_millis() as i64;
                updates.push((*id, retry_count, Some(now + delay_ms)));
            }
        }

        let mut batch = ClaimedBatch::default();
        for (id, retry_count, attempt_at) in updates {
            if let Some(record) = state.records.get_mut(&id) {
                record.retry_count = retry_count;
                record.attempt_at = attempt_at;
                if attempt_at.is_none() {
                    record.status = OutboxStatus::Failed;
                    batch.dead_lettered.push(record.clone());
                } else {
                    batch.pending.push(record.clone());
                }
            }
        }

        debug!(
            pending = batch.pending.len(),
            dead_lettered = batch.dead_lettered.len(),
            "claimed due records"
        );
        Ok(batch)
    }

    async fn find_pending(&self, limit: usize) -> OutboxResult<Vec<OutboxRecord>> {
        let state = self.inner.state.lock();
        let mut pending: Vec<OutboxRecord> = state
            .records
            .values()
            .filter(|record| record.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|record| (record.inserted_at, record.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn sweep_expired(&self, now_ms: i64) -> OutboxResult<u64> {
        let mut state = self.inner.state.lock();
        let expired: Vec<i64> = state
            .records
            .values()
            .filter(|record| record.expire_at <= now_ms)
            .map(|record| record.id)
            .collect();
        for id in &expired {
            state.records.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn requeue_failed(&self, limit: usize, attempt_at: i64) -> OutboxResult<u64> {
        let mut state = self.inner.state.lock();
        let failed: Vec<i64> = state
            .records
            .values()
            .filter(|record| record.status == OutboxStatus::Failed)
            .map(|record| record.id)
            .take(limit)
            .collect();
        for id in &failed {
            if let Some(record) = state.records.get_mut(id) {
                record.status = OutboxStatus::Pending;
                record.attempt_at = Some(attempt_at);
                record.retry_count = 0;
            }
        }
        Ok(failed.len() as u64)
    }
}

enum StagedWrite {
    Entity(EntityOpKind, MemoryEntity),
    InsertRecord(OutboxRecord),
    MarkDelivered {
        record_id: i64,
        delivered: BTreeSet<String>,
    },
    RemoveRecord(i64),
}

struct MemoryUnitOfWork {
    inner: Arc<MemoryInner>,
    staged: Vec<StagedWrite>,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    fn stage_entity(&mut self, op: EntityOp) -> OutboxResult<()> {
        let entity = downcast_entity(op.entity)?;
        self.staged.push(StagedWrite::Entity(op.kind, entity));
        Ok(())
    }

    fn stage_insert_record(&mut self, record: OutboxRecord) {
        self.staged.push(StagedWrite::InsertRecord(record));
    }

    fn stage_mark_delivered(&mut self, record_id: i64, delivered: BTreeSet<String>) {
        self.staged.push(StagedWrite::MarkDelivered {
            record_id,
            delivered,
        });
    }

    fn stage_remove_record(&mut self, record_id: i64) {
        self.staged.push(StagedWrite::RemoveRecord(record_id));
    }

    async fn commit(self: Box<Self>) -> OutboxResult<Vec<OutboxRecord>> {
        if self.inner.fail_commits.load(Ordering::SeqCst) {
            return Err(OutboxError::storage(anyhow!("commit failed (injected)")));
        }

        // One lock for the whole batch: all staged writes land or none do.
        let mut state = self.inner.state.lock();
        let mut inserted = Vec::new();
        for write in self.staged {
            match write {
                StagedWrite::Entity(EntityOpKind::Persist, entity) => {
                    state
                        .entities
                        .insert((entity.collection, entity.key), entity.value);
                }
                StagedWrite::Entity(EntityOpKind::Remove, entity) => {
                    state.entities.remove(&(entity.collection, entity.key));
                }
                StagedWrite::InsertRecord(mut record) => {
                    record.id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                    state.records.insert(record.id, record.clone());
                    inserted.push(record);
                }
                StagedWrite::MarkDelivered {
                    record_id,
                    delivered,
                } => {
                    if let Some(record) = state.records.get_mut(&record_id) {
                        record.delivered_to_listeners = delivered;
                    }
                }
                StagedWrite::RemoveRecord(record_id) => {
                    state.records.remove(&record_id);
                }
            }
        }
        Ok(inserted)
    }
}

fn downcast_entity(entity: Box<dyn Any + Send>) -> OutboxResult<MemoryEntity> {
    entity
        .downcast::<MemoryEntity>()
        .map(|boxed| *boxed)
        .map_err(|_| OutboxError::UnsupportedEntity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::EventConfiguration;
    use serde_json::json;
    use std::time::Duration;

    fn registry(max_retries: u32) -> Arc<EventConfigRegistry> {
        let config = EventConfiguration {
            ready_to_retry_after_ttl: Duration::from_millis(1_000),
            max_retries,
            ..EventConfiguration::new("order.created")
        };
        Arc::new(EventConfigRegistry::new([config]).unwrap())
    }

    fn driver(max_retries: u32) -> (MemoryDriver, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let driver = MemoryDriver::new(registry(max_retries), clock.clone());
        (driver, clock)
    }

    async fn insert(driver: &MemoryDriver, attempt_at: i64) -> OutboxRecord {
        let record = driver.create_record("order.created", json!({}), 60_000, attempt_at);
        let mut uow = driver.unit_of_work();
        uow.stage_insert_record(record);
        uow.commit().await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn commit_applies_entities_and_records_together() {
        let (driver, _clock) = driver(3);
        let record = driver.create_record("order.created", json!({"order_id": 1}), 60_000, 0);

        let mut uow = driver.unit_of_work();
        uow.stage_entity(EntityOp::persist(MemoryEntity::new(
            "orders",
            "1",
            json!({"total": 5}),
        )))
        .unwrap();
        uow.stage_insert_record(record);
        let inserted = uow.commit().await.unwrap();

        assert_eq!(inserted.len(), 1);
        assert!(inserted[0].id > 0);
        assert_eq!(driver.record_count(), 1);
        assert_eq!(driver.entity("orders", "1"), Some(json!({"total": 5})));
    }

    #[tokio::test]
    async fn injected_commit_failure_applies_nothing() {
        let (driver, _clock) = driver(3);
        driver.set_fail_commits(true);

        let mut uow = driver.unit_of_work();
        uow.stage_entity(EntityOp::persist(MemoryEntity::new("orders", "1", json!({}))))
            .unwrap();
        uow.stage_insert_record(driver.create_record("order.created", json!({}), 60_000, 0));
        assert!(uow.commit().await.is_err());

        assert_eq!(driver.record_count(), 0);
        assert_eq!(driver.entity_count(), 0);
    }

    #[tokio::test]
    async fn foreign_entity_kind_is_rejected_at_stage_time() {
        let (driver, _clock) = driver(3);
        let mut uow = driver.unit_of_work();
        let err = uow.stage_entity(EntityOp::persist("not a memory entity")).unwrap_err();
        assert!(matches!(err, OutboxError::UnsupportedEntity));
    }

    #[tokio::test]
    async fn claim_extends_deadline_and_counts_the_attempt() {
        let (driver, clock) = driver(3);
        let record = insert(&driver, 0).await;

        clock.set_ms(10);
        let batch = driver.claim_due_batch(10).await.unwrap();
        assert_eq!(batch.pending.len(), 1);
        assert!(batch.dead_lettered.is_empty());

        let claimed = driver.record(record.id).unwrap();
        assert_eq!(claimed.retry_count, 1);
        assert_eq!(claimed.attempt_at, Some(10 + 1_000));
        assert_eq!(claimed.status, OutboxStatus::Pending);

        // Not due again until the extended deadline elapses.
        assert!(driver.claim_due_batch(10).await.unwrap().pending.is_empty());
        clock.set_ms(10 + 1_000);
        assert_eq!(driver.claim_due_batch(10).await.unwrap().pending.len(), 1);
    }

    #[tokio::test]
    async fn claim_dead_letters_at_max_retries() {
        let (driver, clock) = driver(2);
        let record = insert(&driver, 0).await;

        // Attempt 1: still pending.
        let batch = driver.claim_due_batch(10).await.unwrap();
        assert_eq!(batch.pending.len(), 1);

        // Attempt 2 reaches max_retries: dead-lettered instead of dispatched.
        clock.set_ms(2_000);
        let batch = driver.claim_due_batch(10).await.unwrap();
        assert!(batch.pending.is_empty());
        assert_eq!(batch.dead_lettered.len(), 1);
        assert_eq!(batch.dead_lettered[0].retry_count, 2);

        let failed = driver.record(record.id).unwrap();
        assert_eq!(failed.status, OutboxStatus::Failed);
        assert_eq!(failed.attempt_at, None);

        // Terminal: never claimed again.
        clock.set_ms(i64::MAX);
        let batch = driver.claim_due_batch(10).await.unwrap();
        assert!(batch.pending.is_empty() && batch.dead_lettered.is_empty());
    }

    #[tokio::test]
    async fn claim_of_unknown_event_rolls_back() {
        let clock = Arc::new(ManualClock::new(0));
        let driver = MemoryDriver::new(registry(3), clock.clone());
        // Insert a record whose event type the registry does not know.
        let mut uow = driver.unit_of_work();
        uow.stage_insert_record(OutboxRecord::new("order.ghost", json!({}), 60_000, 0, 0));
        uow.stage_insert_record(OutboxRecord::new("order.created", json!({}), 60_000, 0, 0));
        let inserted = uow.commit().await.unwrap();

        assert!(matches!(
            driver.claim_due_batch(10).await,
            Err(OutboxError::UnknownEvent(name)) if name == "order.ghost"
        ));
        // Nothing was mutated, including the known record sharing the batch.
        for record in inserted {
            let stored = driver.record(record.id).unwrap();
            assert_eq!(stored.retry_count, 0);
            assert_eq!(stored.status, OutboxStatus::Pending);
        }
    }

    #[tokio::test]
    async fn claim_respects_limit_and_deadline_order() {
        let (driver, clock) = driver(10);
        let oldest = insert(&driver, 5).await;
        let newer = insert(&driver, 20).await;
        let newest = insert(&driver, 30).await;

        clock.set_ms(100);
        let batch = driver.claim_due_batch(2).await.unwrap();
        let claimed: Vec<i64> = batch.pending.iter().map(|r| r.id).collect();
        assert_eq!(claimed, vec![oldest.id, newer.id]);
        assert_eq!(driver.record(newest.id).unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn find_pending_is_a_pure_snapshot() {
        let (driver, clock) = driver(3);
        insert(&driver, 0).await;
        insert(&driver, 0).await;

        clock.set_ms(10);
        let pending = driver.find_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|record| record.retry_count == 0));
        assert_eq!(driver.find_pending(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_records() {
        let (driver, clock) = driver(3);
        let expired = {
            let record = driver.create_record("order.created", json!({}), 100, 0);
            let mut uow = driver.unit_of_work();
            uow.stage_insert_record(record);
            uow.commit().await.unwrap().remove(0)
        };
        let alive = insert(&driver, 0).await;

        clock.set_ms(150);
        assert_eq!(driver.sweep_expired(clock.now_ms()).await.unwrap(), 1);
        assert!(driver.record(expired.id).is_none());
        assert!(driver.record(alive.id).is_some());
    }

    #[tokio::test]
    async fn requeue_revives_dead_letters() {
        let (driver, clock) = driver(1);
        let record = insert(&driver, 0).await;

        // max_retries = 1: first claim dead-letters immediately.
        let batch = driver.claim_due_batch(10).await.unwrap();
        assert_eq!(batch.dead_lettered.len(), 1);

        clock.set_ms(500);
        assert_eq!(driver.requeue_failed(10, 500).await.unwrap(), 1);
        let revived = driver.record(record.id).unwrap();
        assert_eq!(revived.status, OutboxStatus::Pending);
        assert_eq!(revived.retry_count, 0);
        assert_eq!(revived.attempt_at, Some(500));
    }
}
