//! # Transactional Outbox engine
//!
//! Guarantees that a domain state change committed to a database and the
//! notifications derived from it are durable together, and delivers those
//! notifications to in-process listeners at-least-once.
//!
//! The emitter stages the outbox record alongside the caller's entity writes
//! and commits them in one transaction, eliminating the dual-write gap
//! between a database commit and a downstream event bus. A background poller
//! then claims due records under row locks, dispatches them to every
//! registered listener that has not yet acknowledged, and tracks
//! per-listener delivery in the record itself so retries never duplicate a
//! successful delivery. Records that exhaust their retry budget surface
//! exactly once through the dead-letter hook.
//!
//! What this engine is not: a cluster coordinator, a global ordering
//! service, or an exactly-once transport. It promises per-event,
//! per-listener at-most-once-successful delivery within one process, with
//! the outbox table living in the same database as the business entities.
//!
//! ## Moving parts
//!
//! - [`StorageDriver`] - pluggable persistence with an atomic
//!   claim-and-extend operation and a staged [`UnitOfWork`].
//!   [`MemoryDriver`] ships in-crate; `outbox-postgres` provides the
//!   sqlx/PostgreSQL driver.
//! - [`OutboxEmitter`] - the transactional entry point.
//! - [`RetryPoller`] - periodic claim cycles, optionally accelerated by a
//!   [`PushNotificationListener`] wake-up stream.
//! - [`EventProcessor`] - per-listener concurrent dispatch with timeout,
//!   middleware pipeline, and exception filters.
//! - [`ManualFlusher`] - administrative drain, retention sweep, and
//!   dead-letter requeue.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use outbox_core::{
//!     Clock, EmittedEvent, EventConfigRegistry, EventConfiguration, MemoryDriver, Outbox,
//!     OutboxListener, SystemClock,
//! };
//! use serde_json::{json, Value};
//!
//! struct AuditTrail;
//!
//! #[async_trait]
//! impl OutboxListener for AuditTrail {
//!     fn name(&self) -> &str {
//!         "audit-trail"
//!     }
//!
//!     async fn handle(&self, payload: &Value, event_name: &str) -> anyhow::Result<()> {
//!         println!("{event_name}: {payload}");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(EventConfigRegistry::new([EventConfiguration {
//!         max_retries: 3,
//!         ..EventConfiguration::new("order.created")
//!     }])?);
//!     let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//!     let driver = Arc::new(MemoryDriver::new(Arc::clone(&registry), clock));
//!
//!     let outbox = Outbox::builder()
//!         .driver(driver)
//!         .registry(registry)
//!         .build()?;
//!     outbox.listeners().add("order.created", Arc::new(AuditTrail))?;
//!
//!     outbox.start().await?;
//!     outbox
//!         .emitter()
//!         .emit(
//!             EmittedEvent::from_value("order.created", json!({"order_id": 7})),
//!             vec![],
//!         )
//!         .await?;
//!     outbox.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod driver;
pub mod emitter;
pub mod error;
pub mod filter;
pub mod flush;
pub mod listener;
pub mod memory;
pub mod metrics;
pub mod middleware;
pub mod notify;
pub mod poller;
pub mod processor;
pub mod record;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{EventConfigRegistry, EventConfiguration, OutboxConfig, RetryStrategy};
pub use context::{DeadLetterContext, EmittedEvent, OutboxEventContext};
pub use driver::{ClaimedBatch, EntityOp, EntityOpKind, StorageDriver, UnitOfWork};
pub use emitter::OutboxEmitter;
pub use error::{ListenerError, OutboxError, OutboxResult};
pub use filter::{ExceptionFilter, FilterChain, FilterHost};
pub use flush::{FlushSummary, ManualFlusher, DEFAULT_FLUSH_LIMIT};
pub use listener::{ListenerRegistry, OutboxListener};
pub use memory::{MemoryDriver, MemoryEntity};
pub use metrics::OutboxMetrics;
pub use middleware::{ExecutionResult, MiddlewarePipeline, Next, OutboxMiddleware};
pub use notify::PushNotificationListener;
pub use poller::{PollerParts, PollerState, RetryPoller};
pub use processor::{EventProcessor, ProcessOutcome};
pub use record::{OutboxRecord, OutboxStatus};

use std::sync::Arc;

/// Assembles the engine: wires the emitter, processor, poller, and flusher
/// around one driver and one configuration registry.
pub struct OutboxBuilder {
    driver: Option<Arc<dyn StorageDriver>>,
    registry: Option<Arc<EventConfigRegistry>>,
    middlewares: Vec<Arc<dyn OutboxMiddleware>>,
    filters: Vec<Arc<dyn ExceptionFilter>>,
    config: OutboxConfig,
    push: Option<Arc<dyn PushNotificationListener>>,
    clock: SharedClock,
    metrics: Option<OutboxMetrics>,
}

impl Default for OutboxBuilder {
    fn default() -> Self {
        Self {
            driver: None,
            registry: None,
            middlewares: Vec::new(),
            filters: Vec::new(),
            config: OutboxConfig::default(),
            push: None,
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }
}

impl OutboxBuilder {
    pub fn driver(mut self, driver: Arc<dyn StorageDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn registry(mut self, registry: Arc<EventConfigRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Append a middleware; registration order is the pipeline order.
    pub fn middleware(mut self, middleware: Arc<dyn OutboxMiddleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Append an exception filter; registration order is the chain order.
    pub fn filter(mut self, filter: Arc<dyn ExceptionFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn config(mut self, config: OutboxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn push_listener(mut self, push: Arc<dyn PushNotificationListener>) -> Self {
        self.push = Some(push);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> OutboxResult<Outbox> {
        let driver = self
            .driver
            .ok_or(OutboxError::Misconfigured("a storage driver is required"))?;
        let registry = self
            .registry
            .ok_or(OutboxError::Misconfigured("an event registry is required"))?;

        let listeners = Arc::new(ListenerRegistry::new());
        let pipeline = Arc::new(MiddlewarePipeline::new(self.middlewares));
        let filters = Arc::new(FilterChain::new(self.filters));

        let mut processor = EventProcessor::new(
            Arc::clone(&driver),
            Arc::clone(&pipeline),
            Arc::clone(&filters),
        );
        if let Some(metrics) = &self.metrics {
            processor = processor.with_metrics(metrics.clone());
        }
        let processor = Arc::new(processor);

        let mut emitter = OutboxEmitter::new(
            Arc::clone(&driver),
            Arc::clone(&registry),
            Arc::clone(&listeners),
            Arc::clone(&pipeline),
            Arc::clone(&processor),
            Arc::clone(&self.clock),
            self.config.dispatch_on_emit,
        );
        if let Some(metrics) = &self.metrics {
            emitter = emitter.with_metrics(metrics.clone());
        }

        let poller = RetryPoller::new(PollerParts {
            driver: Arc::clone(&driver),
            registry: Arc::clone(&registry),
            listeners: Arc::clone(&listeners),
            processor: Arc::clone(&processor),
            pipeline: Arc::clone(&pipeline),
            config: self.config,
            push: self.push,
            metrics: self.metrics,
        });

        let flusher = ManualFlusher::new(
            Arc::clone(&driver),
            Arc::clone(&registry),
            Arc::clone(&listeners),
            Arc::clone(&processor),
            Arc::clone(&self.clock),
        );

        Ok(Outbox {
            emitter: Arc::new(emitter),
            poller: Arc::new(poller),
            flusher: Arc::new(flusher),
            listeners,
        })
    }
}

/// The assembled engine.
pub struct Outbox {
    emitter: Arc<OutboxEmitter>,
    poller: Arc<RetryPoller>,
    flusher: Arc<ManualFlusher>,
    listeners: Arc<ListenerRegistry>,
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox").finish_non_exhaustive()
    }
}

impl Outbox {
    pub fn builder() -> OutboxBuilder {
        OutboxBuilder::default()
    }

    pub fn emitter(&self) -> &OutboxEmitter {
        &self.emitter
    }

    pub fn poller(&self) -> &RetryPoller {
        &self.poller
    }

    pub fn flusher(&self) -> &ManualFlusher {
        &self.flusher
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// Start the retry poller.
    pub async fn start(&self) -> OutboxResult<()> {
        self.poller.start().await
    }

    /// Gracefully stop the poller, waiting out in-flight dispatches.
    pub async fn shutdown(&self) {
        self.poller.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_requires_driver_and_registry() {
        let err = Outbox::builder().build().unwrap_err();
        assert!(matches!(err, OutboxError::Misconfigured(_)));

        let registry = Arc::new(
            EventConfigRegistry::new([EventConfiguration::new("order.created")]).unwrap(),
        );
        let err = Outbox::builder().registry(registry).build().unwrap_err();
        assert!(matches!(err, OutboxError::Misconfigured(_)));
    }

    #[tokio::test]
    async fn built_outbox_exposes_wired_parts() {
        let registry = Arc::new(
            EventConfigRegistry::new([EventConfiguration::new("order.created")]).unwrap(),
        );
        let driver = Arc::new(MemoryDriver::new(
            Arc::clone(&registry),
            Arc::new(SystemClock),
        ));
        let outbox = Outbox::builder()
            .driver(driver)
            .registry(registry)
            .build()
            .unwrap();

        assert_eq!(outbox.poller().state(), PollerState::Idle);
        assert!(outbox.listeners().event_names().is_empty());
        let summary = outbox.flusher().process_all_pending(10).await.unwrap();
        assert_eq!(summary.processed_count, 0);
    }
}
