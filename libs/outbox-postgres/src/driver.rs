//! sqlx/PostgreSQL storage driver: staged transactional writes and the
//! skip-locked claim.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use outbox_core::{
    ClaimedBatch, EntityOp, EntityOpKind, EventConfigRegistry, OutboxError, OutboxRecord,
    OutboxResult, OutboxStatus, SharedClock, StorageDriver, SystemClock, UnitOfWork,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::entity::{PgEntity, PgEntityOp};

pub(crate) trait SqlxResultExt<T> {
    fn storage_context(self, msg: &'static str) -> OutboxResult<T>;
}

impl<T> SqlxResultExt<T> for Result<T, sqlx::Error> {
    fn storage_context(self, msg: &'static str) -> OutboxResult<T> {
        self.context(msg).map_err(OutboxError::Storage)
    }
}

pub struct PgDriver {
    pool: PgPool,
    registry: Arc<EventConfigRegistry>,
    clock: SharedClock,
}

impl PgDriver {
    pub fn new(pool: PgPool, registry: Arc<EventConfigRegistry>) -> Self {
        Self::with_clock(pool, registry, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, registry: Arc<EventConfigRegistry>, clock: SharedClock) -> Self {
        Self {
            pool,
            registry,
            clock,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn record_from_row(row: &PgRow) -> OutboxResult<OutboxRecord> {
    let delivered_value: Value = row
        .try_get("delivered_to_listeners")
        .storage_context("failed to decode delivered_to_listeners")?;
    let delivered_to_listeners: BTreeSet<String> = serde_json::from_value(delivered_value)?;

    let status_raw: String = row.try_get("status").storage_context("failed to decode status")?;
    let status = OutboxStatus::parse(&status_raw)
        .ok_or_else(|| OutboxError::storage(anyhow!("unrecognized status '{status_raw}'")))?;

    let retry_count: i32 = row
        .try_get("retry_count")
        .storage_context("failed to decode retry_count")?;

    Ok(OutboxRecord {
        id: row.try_get("id").storage_context("failed to decode id")?,
        event_name: row
            .try_get("event_name")
            .storage_context("failed to decode event_name")?,
        event_payload: row
            .try_get("event_payload")
            .storage_context("failed to decode event_payload")?,
        delivered_to_listeners,
        attempt_at: row
            .try_get("attempt_at")
            .storage_context("failed to decode attempt_at")?,
        retry_count: retry_count as u32,
        status,
        expire_at: row
            .try_get("expire_at")
            .storage_context("failed to decode expire_at")?,
        inserted_at: row
            .try_get("inserted_at")
            .storage_context("failed to decode inserted_at")?,
    })
}

#[async_trait]
impl StorageDriver for PgDriver {
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
            self.clock.now_ms(),
        )
    }

    fn unit_of_work(&self) -> Box<dyn UnitOfWork> {
        Box::new(PgUnitOfWork {
            pool: self.pool.clone(),
            staged: Vec::new(),
        })
    }

    async fn claim_due_batch(&self, limit: usize) -> OutboxResult<ClaimedBatch> {
        let now = self.clock.now_ms();
        let mut tx = self
            .pool
            .begin()
            .await
            .storage_context("failed to begin claim transaction")?;

        // Row-level exclusive locks; concurrent claimers skip each other's
        // rows instead of queueing on them.
        let rows = sqlx::query(
            r#"
            SELECT
                id, event_name, event_payload, delivered_to_listeners,
                attempt_at, retry_count, status, expire_at, inserted_at
            FROM outbox_transport_event
            WHERE status = 'pending' AND attempt_at <= $1
            ORDER BY attempt_at ASC, id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .storage_context("failed to select due records")?;

        let mut batch = ClaimedBatch::default();
        for row in &rows {
            let mut record = record_from_row(row)?;
            // UnknownEvent drops the transaction here: every lock releases
            // and no row was touched.
            let config = self.registry.resolve(&record.event_name)?;

            record.retry_count += 1;
            if record.retry_count >= config.max_retries {
                record.status = OutboxStatus::Failed;
                record.attempt_at = None;
                sqlx::query(
                    r#"
                    UPDATE outbox_transport_event
                    SET retry_count = $2, status = 'failed', attempt_at = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(record.id)
                .bind(record.retry_count as i32)
                .execute(&mut *tx)
                .await
                .storage_context("failed to dead-letter record")?;
                batch.dead_lettered.push(record);
            } else {
                let next_attempt = now + config.retry_delay(record.retry_count).as_millis() as i64;
                record.attempt_at = Some(next_attempt);
                sqlx::query(
                    r#"
                    UPDATE outbox_transport_event
                    SET retry_count = $2, attempt_at = $3
                    WHERE id = $1
                    "#,
                )
                .bind(record.id)
                .bind(record.retry_count as i32)
                .bind(next_attempt)
                .execute(&mut *tx)
                .await
                .storage_context("failed to extend record deadline")?;
                batch.pending.push(record);
            }
        }

        tx.commit()
            .await
            .storage_context("failed to commit claim transaction")?;

        debug!(
            pending = batch.pending.len(),
            dead_lettered = batch.dead_lettered.len(),
            "claimed due records"
        );
        Ok(batch)
    }

    async fn find_pending(&self, limit: usize) -> OutboxResult<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT
                id, event_name, event_payload, delivered_to_listeners,
                attempt_at, retry_count, status, expire_at, inserted_at
            FROM outbox_transport_event
            WHERE status = 'pending'
            ORDER BY inserted_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .storage_context("failed to fetch pending records")?;

        rows.iter().map(record_from_row).collect()
    }

    async fn sweep_expired(&self, now_ms: i64) -> OutboxResult<u64> {
        let result = sqlx::query("DELETE FROM outbox_transport_event WHERE expire_at <= $1")
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .storage_context("failed to sweep expired records")?;
        Ok(result.rows_affected())
    }

    async fn requeue_failed(&self, limit: usize, attempt_at: i64) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_transport_event
            SET status = 'pending', attempt_at = $2, retry_count = 0
            WHERE id IN (
                SELECT id FROM outbox_transport_event
                WHERE status = 'failed'
                ORDER BY id ASC
                LIMIT $1
            )
            "#,
        )
        .bind(limit as i64)
        .bind(attempt_at)
        .execute(&self.pool)
        .await
        .storage_context("failed to requeue dead-lettered records")?;
        Ok(result.rows_affected())
    }
}

enum StagedWrite {
    Entity(EntityOpKind, Box<dyn PgEntity>),
    InsertRecord(OutboxRecord),
    MarkDelivered {
        record_id: i64,
        delivered: BTreeSet<String>,
    },
    RemoveRecord(i64),
}

pub struct PgUnitOfWork {
    pool: PgPool,
    staged: Vec<StagedWrite>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    fn stage_entity(&mut self, op: EntityOp) -> OutboxResult<()> {
        let entity = op
            .entity
            .downcast::<PgEntityOp>()
            .map_err(|_| OutboxError::UnsupportedEntity)?;
        self.staged.push(StagedWrite::Entity(op.kind, entity.0));
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
        let Self { pool, staged } = *self;
        let mut tx = pool
            .begin()
            .await
            .storage_context("failed to begin transaction")?;

        let mut inserted = Vec::new();
        for write in staged {
            match write {
                StagedWrite::Entity(EntityOpKind::Persist, entity) => {
                    entity.persist(&mut *tx).await?;
                }
                StagedWrite::Entity(EntityOpKind::Remove, entity) => {
                    entity.remove(&mut *tx).await?;
                }
                StagedWrite::InsertRecord(mut record) => {
                    let row = sqlx::query(
                        r#"
                        INSERT INTO outbox_transport_event (
                            event_name, event_payload, delivered_to_listeners,
                            attempt_at, retry_count, status, expire_at, inserted_at
                        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                        RETURNING id
                        "#,
                    )
                    .bind(&record.event_name)
                    .bind(&record.event_payload)
                    .bind(serde_json::to_value(&record.delivered_to_listeners)?)
                    .bind(record.attempt_at)
                    .bind(record.retry_count as i32)
                    .bind(record.status.as_str())
                    .bind(record.expire_at)
                    .bind(record.inserted_at)
                    .fetch_one(&mut *tx)
                    .await
                    .storage_context("failed to insert outbox record")?;
                    record.id = row.try_get("id").storage_context("failed to decode inserted id")?;
                    debug!(
                        event_id = record.id,
                        event_name = %record.event_name,
                        "outbox record staged for commit"
                    );
                    inserted.push(record);
                }
                StagedWrite::MarkDelivered {
                    record_id,
                    delivered,
                } => {
                    sqlx::query(
                        r#"
                        UPDATE outbox_transport_event
                        SET delivered_to_listeners = $2
                        WHERE id = $1
                        "#,
                    )
                    .bind(record_id)
                    .bind(serde_json::to_value(&delivered)?)
                    .execute(&mut *tx)
                    .await
                    .storage_context("failed to persist delivered set")?;
                }
                StagedWrite::RemoveRecord(record_id) => {
                    sqlx::query("DELETE FROM outbox_transport_event WHERE id = $1")
                        .bind(record_id)
                        .execute(&mut *tx)
                        .await
                        .storage_context("failed to remove delivered record")?;
                }
            }
        }

        tx.commit()
            .await
            .storage_context("failed to commit unit of work")?;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_core::{EventConfiguration, ManualClock, MemoryEntity};

    fn lazy_driver() -> PgDriver {
        let pool = PgPool::connect_lazy("postgresql://localhost/outbox_test")
            .expect("lazy pool construction");
        let registry =
            Arc::new(EventConfigRegistry::new([EventConfiguration::new("order.created")]).unwrap());
        PgDriver::with_clock(pool, registry, Arc::new(ManualClock::new(1_000)))
    }

    #[tokio::test]
    async fn create_record_stamps_the_clock() {
        let driver = lazy_driver();
        let record = driver.create_record("order.created", serde_json::json!({}), 7_000, 6_000);
        assert_eq!(record.id, 0);
        assert_eq!(record.inserted_at, 1_000);
        assert_eq!(record.attempt_at, Some(6_000));
        assert_eq!(record.expire_at, 7_000);
        assert_eq!(record.status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn unit_of_work_rejects_foreign_entities() {
        let driver = lazy_driver();
        let mut uow = driver.unit_of_work();
        let err = uow
            .stage_entity(EntityOp::persist(MemoryEntity::new(
                "orders",
                "1",
                serde_json::json!({}),
            )))
            .unwrap_err();
        assert!(matches!(err, OutboxError::UnsupportedEntity));
    }

    #[tokio::test]
    async fn unit_of_work_accepts_pg_entities() {
        struct Order;

        #[async_trait]
        impl PgEntity for Order {
            async fn persist(&self, _conn: &mut sqlx::PgConnection) -> OutboxResult<()> {
                Ok(())
            }

            async fn remove(&self, _conn: &mut sqlx::PgConnection) -> OutboxResult<()> {
                Ok(())
            }
        }

        let driver = lazy_driver();
        let mut uow = driver.unit_of_work();
        uow.stage_entity(PgEntityOp::persist(Order)).unwrap();
        uow.stage_entity(PgEntityOp::remove(Order)).unwrap();
    }
}
