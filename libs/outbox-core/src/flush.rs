//! Administrative surface: synchronous drain of pending records, retention
//! sweep, and dead-letter requeue.

use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::config::EventConfigRegistry;
use crate::driver::StorageDriver;
use crate::error::OutboxResult;
use crate::listener::ListenerRegistry;
use crate::processor::EventProcessor;

/// Default upper bound for one `process_all_pending` pass.
pub const DEFAULT_FLUSH_LIMIT: usize = 1000;

/// Counts from one flush pass. `processed_count` is records whose remaining
/// listeners all succeeded (record removed); `failed_count` is records with
/// at least one remaining failure or a driver error during their dispatch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    pub processed_count: usize,
    pub failed_count: usize,
}

pub struct ManualFlusher {
    driver: Arc<dyn StorageDriver>,
    registry: Arc<EventConfigRegistry>,
    listeners: Arc<ListenerRegistry>,
    processor: Arc<EventProcessor>,
    clock: SharedClock,
}

impl ManualFlusher {
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        registry: Arc<EventConfigRegistry>,
        listeners: Arc<ListenerRegistry>,
        processor: Arc<EventProcessor>,
        clock: SharedClock,
    ) -> Self {
        Self {
            driver,
            registry,
            listeners,
            processor,
            clock,
        }
    }

    /// Snapshot up to `limit` pending records and dispatch each through the
    /// processor, sequentially, regardless of `attempt_at`. Claim-owned
    /// fields are untouched; the poller's schedule is unaffected.
    pub async fn process_all_pending(&self, limit: usize) -> OutboxResult<FlushSummary> {
        let records = self.driver.find_pending(limit).await?;
        let mut summary = FlushSummary::default();

        for record in records {
            let remaining: Vec<_> = self
                .listeners
                .get(&record.event_name)
                .into_iter()
                .filter(|listener| !record.is_delivered_to(listener.name()))
                .collect();
            if remaining.is_empty() {
                continue;
            }
            let config = match self.registry.resolve(&record.event_name) {
                Ok(config) => config.clone(),
                Err(resolve_error) => {
                    warn!(
                        error = ?resolve_error,
                        event_name = %record.event_name,
                        "skipping pending record with no configuration"
                    );
                    summary.failed_count += 1;
                    continue;
                }
            };

            match self.processor.process(&config, record, remaining).await {
                Ok(outcome) if outcome.fully_delivered() => summary.processed_count += 1,
                Ok(_) => summary.failed_count += 1,
                Err(dispatch_error) => {
                    warn!(error = ?dispatch_error, "manual dispatch failed");
                    summary.failed_count += 1;
                }
            }
        }

        info!(
            processed = summary.processed_count,
            failed = summary.failed_count,
            "manual flush finished"
        );
        Ok(summary)
    }

    /// Delete records whose retention TTL elapsed. Returns the count.
    pub async fn sweep_expired(&self) -> OutboxResult<u64> {
        self.driver.sweep_expired(self.clock.now_ms()).await
    }

    /// Flip up to `limit` dead-lettered records back to pending, immediately
    /// eligible for the next claim cycle. Returns the count.
    pub async fn requeue_dead_lettered(&self, limit: usize) -> OutboxResult<u64> {
        self.driver.requeue_failed(limit, self.clock.now_ms()).await
    }
}
