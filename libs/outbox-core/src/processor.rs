//! Dispatches one outbox record to its not-yet-delivered listeners and
//! persists the outcome.
//!
//! No storage transaction is held while listeners run; the processor opens a
//! fresh unit of work only after every listener settled. `retry_count`,
//! `attempt_at`, and `status` are never touched here; they belong to the
//! driver's claim operation.

use std::sync::Arc;
use std::time::Instant;

use futures::future::{join_all, BoxFuture};
use tracing::{debug, info, warn};

use crate::config::EventConfiguration;
use crate::context::OutboxEventContext;
use crate::driver::StorageDriver;
use crate::error::{ListenerError, OutboxResult};
use crate::filter::FilterChain;
use crate::listener::OutboxListener;
use crate::metrics::OutboxMetrics;
use crate::middleware::{ExecutionResult, MiddlewarePipeline};
use crate::record::OutboxRecord;

/// What one processor run did to a record.
#[derive(Debug)]
pub struct ProcessOutcome {
    /// Listener names newly added to the delivered set
    pub delivered: Vec<String>,
    /// Listener names that failed or timed out this run
    pub failed: Vec<String>,
    /// The record was deleted: every listener for its event has delivered
    pub removed: bool,
}

impl ProcessOutcome {
    pub fn fully_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

struct ListenerOutcome {
    name: String,
    error: Option<ListenerError>,
}

pub struct EventProcessor {
    driver: Arc<dyn StorageDriver>,
    pipeline: Arc<MiddlewarePipeline>,
    filters: Arc<FilterChain>,
    metrics: Option<OutboxMetrics>,
}

impl EventProcessor {
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        pipeline: Arc<MiddlewarePipeline>,
        filters: Arc<FilterChain>,
    ) -> Self {
        Self {
            driver,
            pipeline,
            filters,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run every listener concurrently, then either delete the record (all
    /// listeners for its event delivered) or re-persist the grown delivered
    /// set. Callers pass only listeners whose names are absent from
    /// `delivered_to_listeners`.
    ///
    /// Listener failures are contained per listener; only a driver commit
    /// failure surfaces as an error, leaving the record in its prior state
    /// for the next claim cycle.
    pub async fn process(
        &self,
        config: &EventConfiguration,
        mut record: OutboxRecord,
        listeners: Vec<Arc<dyn OutboxListener>>,
    ) -> OutboxResult<ProcessOutcome> {
        let outcomes = join_all(
            listeners
                .iter()
                .map(|listener| self.run_listener(config, &record, Arc::clone(listener))),
        )
        .await;

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome.error {
                None => delivered.push(outcome.name),
                Some(_) => failed.push(outcome.name),
            }
        }

        for name in &delivered {
            record.delivered_to_listeners.insert(name.clone());
        }

        let removed = failed.is_empty();
        if removed {
            let mut uow = self.driver.unit_of_work();
            uow.stage_remove_record(record.id);
            uow.commit().await?;
            info!(
                event_id = record.id,
                event_name = %record.event_name,
                "record fully delivered, removed"
            );
        } else if !delivered.is_empty() {
            let mut uow = self.driver.unit_of_work();
            uow.stage_mark_delivered(record.id, record.delivered_to_listeners.clone());
            uow.commit().await?;
            debug!(
                event_id = record.id,
                delivered = delivered.len(),
                failed = failed.len(),
                "partial delivery persisted"
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.delivered.inc_by(delivered.len() as u64);
            metrics.listener_failures.inc_by(failed.len() as u64);
        }

        Ok(ProcessOutcome {
            delivered,
            failed,
            removed,
        })
    }

    async fn run_listener(
        &self,
        config: &EventConfiguration,
        record: &OutboxRecord,
        listener: Arc<dyn OutboxListener>,
    ) -> ListenerOutcome {
        let ctx = OutboxEventContext {
            event_name: record.event_name.clone(),
            event_payload: record.event_payload.clone(),
            event_id: record.id,
            listener_name: listener.name().to_string(),
        };
        let started = Instant::now();

        self.pipeline.before_process(&ctx).await;

        let terminal: BoxFuture<'_, Result<(), ListenerError>> = Box::pin(async {
            listener
                .handle(&ctx.event_payload, &ctx.event_name)
                .await
                .map_err(ListenerError::Failed)
        });
        let wrapped = self.pipeline.wrap_execution(&ctx, terminal);

        // Race against the per-listener deadline; on expiry the continuation
        // is dropped and the attempt counts as a failure.
        let result = match tokio::time::timeout(config.max_execution_time_ttl, wrapped).await {
            Ok(result) => result,
            Err(_) => Err(ListenerError::TimedOut(config.max_execution_time_ttl)),
        };
        let duration = started.elapsed();

        match result {
            Ok(()) => {
                self.pipeline
                    .after_process(&ctx, &ExecutionResult::success(duration))
                    .await;
                ListenerOutcome {
                    name: ctx.listener_name,
                    error: None,
                }
            }
            Err(listener_error) => {
                warn!(
                    event_id = ctx.event_id,
                    listener = %ctx.listener_name,
                    error = %listener_error,
                    "listener invocation failed"
                );
                self.pipeline.on_error(&ctx, &listener_error).await;
                self.filters.dispatch(&listener_error, &ctx).await;
                let result = ExecutionResult::failure(listener_error, duration);
                self.pipeline.after_process(&ctx, &result).await;
                ListenerOutcome {
                    name: ctx.listener_name,
                    error: result.error,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EventConfigRegistry;
    use crate::memory::MemoryDriver;
    use crate::middleware::OutboxMiddleware;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct ScriptedListener {
        name: &'static str,
        calls: Arc<AtomicU32>,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl OutboxListener for ScriptedListener {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, _payload: &Value, _event_name: &str) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                Err(anyhow!("handler refused"))
            } else {
                Ok(())
            }
        }
    }

    fn listener(name: &'static str, fail: bool) -> (Arc<dyn OutboxListener>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let listener = Arc::new(ScriptedListener {
            name,
            calls: Arc::clone(&calls),
            fail,
            delay: None,
        });
        (listener, calls)
    }

    struct Recording {
        results: Arc<Mutex<Vec<(String, bool, u64)>>>,
    }

    #[async_trait]
    impl OutboxMiddleware for Recording {
        async fn after_process(
            &self,
            ctx: &OutboxEventContext,
            result: &ExecutionResult,
        ) -> anyhow::Result<()> {
            self.results
                .lock()
                .push((ctx.listener_name.clone(), result.success, result.duration_ms));
            Ok(())
        }
    }

    fn fixture() -> (MemoryDriver, EventProcessor, EventConfiguration) {
        let config = EventConfiguration {
            max_execution_time_ttl: Duration::from_millis(200),
            ..EventConfiguration::new("order.created")
        };
        let registry = Arc::new(EventConfigRegistry::new([config.clone()]).unwrap());
        let driver = MemoryDriver::new(registry, Arc::new(ManualClock::new(0)));
        let processor = EventProcessor::new(
            Arc::new(driver.clone()),
            Arc::new(MiddlewarePipeline::default()),
            Arc::new(FilterChain::default()),
        );
        (driver, processor, config)
    }

    async fn insert(driver: &MemoryDriver) -> OutboxRecord {
        let record = driver.create_record("order.created", json!({"order_id": 1}), 60_000, 0);
        let mut uow = driver.unit_of_work();
        uow.stage_insert_record(record);
        uow.commit().await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn full_success_removes_the_record() {
        let (driver, processor, config) = fixture();
        let record = insert(&driver).await;
        let (a, a_calls) = listener("a", false);
        let (b, b_calls) = listener("b", false);

        let outcome = processor.process(&config, record.clone(), vec![a, b]).await.unwrap();
        assert!(outcome.removed);
        assert_eq!(outcome.delivered.len(), 2);
        assert!(outcome.failed.is_empty());
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert!(driver.record(record.id).is_none());
    }

    #[tokio::test]
    async fn partial_failure_persists_the_delivered_set() {
        let (driver, processor, config) = fixture();
        let record = insert(&driver).await;
        let (ok, _) = listener("a", false);
        let (bad, _) = listener("b", true);

        let outcome = processor.process(&config, record.clone(), vec![ok, bad]).await.unwrap();
        assert!(!outcome.removed);
        assert_eq!(outcome.delivered, ["a"]);
        assert_eq!(outcome.failed, ["b"]);

        let stored = driver.record(record.id).unwrap();
        assert!(stored.is_delivered_to("a"));
        assert!(!stored.is_delivered_to("b"));
        // Claim-owned fields untouched.
        assert_eq!(stored.retry_count, record.retry_count);
        assert_eq!(stored.attempt_at, record.attempt_at);
    }

    #[tokio::test]
    async fn all_failures_leave_the_record_untouched() {
        let (driver, processor, config) = fixture();
        let record = insert(&driver).await;
        let (bad, _) = listener("a", true);

        let outcome = processor.process(&config, record.clone(), vec![bad]).await.unwrap();
        assert!(!outcome.removed);
        assert!(outcome.delivered.is_empty());

        let stored = driver.record(record.id).unwrap();
        assert!(stored.delivered_to_listeners.is_empty());
    }

    #[tokio::test]
    async fn timeout_counts_as_failure_with_full_duration() {
        let (driver, _, mut config) = fixture();
        config.max_execution_time_ttl = Duration::from_millis(50);
        let record = insert(&driver).await;

        let calls = Arc::new(AtomicU32::new(0));
        let slow: Arc<dyn OutboxListener> = Arc::new(ScriptedListener {
            name: "slow",
            calls,
            fail: false,
            delay: Some(Duration::from_millis(200)),
        });

        let results = Arc::new(Mutex::new(Vec::new()));
        let processor = EventProcessor::new(
            Arc::new(driver.clone()),
            Arc::new(MiddlewarePipeline::new(vec![Arc::new(Recording {
                results: Arc::clone(&results),
            })])),
            Arc::new(FilterChain::default()),
        );

        let outcome = processor.process(&config, record.clone(), vec![slow]).await.unwrap();
        assert_eq!(outcome.failed, ["slow"]);

        let seen = results.lock();
        assert_eq!(seen.len(), 1);
        let (ref name, success, duration_ms) = seen[0];
        assert_eq!(name, "slow");
        assert!(!success);
        assert!(duration_ms >= 50);

        // Record still pending for the next claim cycle.
        assert!(driver.record(record.id).is_some());
    }

    #[tokio::test]
    async fn commit_failure_surfaces_and_preserves_state() {
        let (driver, processor, config) = fixture();
        let record = insert(&driver).await;
        let (ok, _) = listener("a", false);

        driver.set_fail_commits(true);
        assert!(processor.process(&config, record.clone(), vec![ok]).await.is_err());

        driver.set_fail_commits(false);
        let stored = driver.record(record.id).unwrap();
        assert!(stored.delivered_to_listeners.is_empty());
    }
}
