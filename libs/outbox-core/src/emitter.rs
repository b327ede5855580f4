//! Transactional entry point: persists the outbox record together with the
//! caller's entity writes in one storage transaction.

use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::EventConfigRegistry;
use crate::context::EmittedEvent;
use crate::driver::{EntityOp, StorageDriver, UnitOfWork};
use crate::error::{OutboxError, OutboxResult};
use crate::listener::ListenerRegistry;
use crate::metrics::OutboxMetrics;
use crate::middleware::MiddlewarePipeline;
use crate::processor::{EventProcessor, ProcessOutcome};
use crate::record::OutboxRecord;

pub struct OutboxEmitter {
    driver: Arc<dyn StorageDriver>,
    registry: Arc<EventConfigRegistry>,
    listeners: Arc<ListenerRegistry>,
    pipeline: Arc<MiddlewarePipeline>,
    processor: Arc<EventProcessor>,
    clock: SharedClock,
    dispatch_on_emit: bool,
    metrics: Option<OutboxMetrics>,
}

impl OutboxEmitter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        registry: Arc<EventConfigRegistry>,
        listeners: Arc<ListenerRegistry>,
        pipeline: Arc<MiddlewarePipeline>,
        processor: Arc<EventProcessor>,
        clock: SharedClock,
        dispatch_on_emit: bool,
    ) -> Self {
        Self {
            driver,
            registry,
            listeners,
            pipeline,
            processor,
            clock,
            dispatch_on_emit,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Commit the event and the entity ops atomically. Returns the persisted
    /// record. Does not block on delivery: when local dispatch is enabled a
    /// fire-and-forget attempt is scheduled, and the poller is the delivery
    /// guarantee either way.
    pub async fn emit(
        &self,
        event: EmittedEvent,
        ops: Vec<EntityOp>,
    ) -> OutboxResult<OutboxRecord> {
        let record = self.commit_event(event, ops).await?;
        if self.dispatch_on_emit {
            self.spawn_local_dispatch(&record);
        }
        Ok(record)
    }

    /// `emit`, then run the processor for the new record against every
    /// currently registered listener and await the outcome.
    pub async fn emit_awaiting(
        &self,
        event: EmittedEvent,
        ops: Vec<EntityOp>,
    ) -> OutboxResult<(OutboxRecord, ProcessOutcome)> {
        let record = self.commit_event(event, ops).await?;

        let listeners = self.listeners.get(&record.event_name);
        if listeners.is_empty() {
            return Ok((
                record,
                ProcessOutcome {
                    delivered: Vec::new(),
                    failed: Vec::new(),
                    removed: false,
                },
            ));
        }
        let config = self
            .registry
            .resolve(&record.event_name)
            .map_err(|_| OutboxError::UnconfiguredEvent(record.event_name.clone()))?
            .clone();
        let outcome = self
            .processor
            .process(&config, record.clone(), listeners)
            .await?;
        Ok((record, outcome))
    }

    /// Stage the event and the entity ops into a caller-supplied unit of
    /// work without committing. The caller's commit (or drop) decides
    /// whether anything becomes durable.
    pub async fn stage_into(
        &self,
        event: EmittedEvent,
        ops: Vec<EntityOp>,
        uow: &mut dyn UnitOfWork,
    ) -> OutboxResult<()> {
        let record = self.prepare_record(event).await?;
        for op in ops {
            uow.stage_entity(op)?;
        }
        uow.stage_insert_record(record);
        Ok(())
    }

    /// Apply `before_emit`, resolve the configuration, and build the record.
    /// Nothing is persisted here.
    async fn prepare_record(&self, event: EmittedEvent) -> OutboxResult<OutboxRecord> {
        let event = self
            .pipeline
            .before_emit(event)
            .await
            .map_err(OutboxError::BeforeEmit)?;

        let config = self
            .registry
            .resolve(&event.name)
            .map_err(|_| OutboxError::UnconfiguredEvent(event.name.clone()))?;

        let now = self.clock.now_ms();
        let expire_at = now + config.expires_at_ttl.as_millis() as i64;
        let attempt_at = now + config.ready_to_retry_after_ttl.as_millis() as i64;
        Ok(self
            .driver
            .create_record(&event.name, event.payload, expire_at, attempt_at))
    }

    async fn commit_event(
        &self,
        event: EmittedEvent,
        ops: Vec<EntityOp>,
    ) -> OutboxResult<OutboxRecord> {
        let record = self.prepare_record(event).await?;

        let mut uow = self.driver.unit_of_work();
        for op in ops {
            uow.stage_entity(op)?;
        }
        uow.stage_insert_record(record);
        let mut inserted = uow.commit().await?;
        let record = inserted
            .pop()
            .ok_or_else(|| OutboxError::storage(anyhow!("commit returned no inserted record")))?;

        if let Some(metrics) = &self.metrics {
            metrics.emitted.inc();
        }
        debug!(
            event_id = record.id,
            event_name = %record.event_name,
            "outbox record committed"
        );
        Ok(record)
    }

    fn spawn_local_dispatch(&self, record: &OutboxRecord) {
        let listeners: Vec<_> = self
            .listeners
            .get(&record.event_name)
            .into_iter()
            .filter(|listener| !record.is_delivered_to(listener.name()))
            .collect();
        if listeners.is_empty() {
            return;
        }
        let config = match self.registry.resolve(&record.event_name) {
            Ok(config) => config.clone(),
            Err(_) => return,
        };
        let processor = Arc::clone(&self.processor);
        let record = record.clone();
        tokio::spawn(async move {
            if let Err(dispatch_error) = processor.process(&config, record, listeners).await {
                warn!(
                    error = ?dispatch_error,
                    "post-emit dispatch failed; record stays due for the poller"
                );
            }
        });
    }
}
