//! Retry poller: long-running scheduler that claims due records and
//! dispatches them.
//!
//! One loop task multiplexes the periodic claim timer with the optional
//! push-notification stream. Claim cycles are serialized within the loop;
//! per-record dispatches run concurrently in the in-flight set. Shutdown
//! stops the timer, unsubscribes from the stream, disconnects the external
//! listener, then waits for every in-flight dispatch with no deadline.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EventConfigRegistry, OutboxConfig};
use crate::context::DeadLetterContext;
use crate::driver::StorageDriver;
use crate::error::{OutboxError, OutboxResult};
use crate::listener::ListenerRegistry;
use crate::metrics::OutboxMetrics;
use crate::middleware::MiddlewarePipeline;
use crate::notify::PushNotificationListener;
use crate::processor::EventProcessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Running,
    ShuttingDown,
    Terminated,
}

/// Everything the poller needs; assembled by the caller (or the `Outbox`
/// facade) so the constructor stays readable.
pub struct PollerParts {
    pub driver: Arc<dyn StorageDriver>,
    pub registry: Arc<EventConfigRegistry>,
    pub listeners: Arc<ListenerRegistry>,
    pub processor: Arc<EventProcessor>,
    pub pipeline: Arc<MiddlewarePipeline>,
    pub config: OutboxConfig,
    pub push: Option<Arc<dyn PushNotificationListener>>,
    pub metrics: Option<OutboxMetrics>,
}

struct PollerInner {
    driver: Arc<dyn StorageDriver>,
    registry: Arc<EventConfigRegistry>,
    listeners: Arc<ListenerRegistry>,
    processor: Arc<EventProcessor>,
    pipeline: Arc<MiddlewarePipeline>,
    config: OutboxConfig,
    push: Option<Arc<dyn PushNotificationListener>>,
    metrics: Option<OutboxMetrics>,
    state: Mutex<PollerState>,
}

pub struct RetryPoller {
    inner: Arc<PollerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl RetryPoller {
    pub fn new(parts: PollerParts) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                driver: parts.driver,
                registry: parts.registry,
                listeners: parts.listeners,
                processor: parts.processor,
                pipeline: parts.pipeline,
                config: parts.config,
                push: parts.push,
                metrics: parts.metrics,
                state: Mutex::new(PollerState::Idle),
            }),
            handle: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> PollerState {
        *self.inner.state.lock()
    }

    /// Connect the push listener (when present) and spawn the wake loop.
    pub async fn start(&self) -> OutboxResult<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != PollerState::Idle {
                return Err(OutboxError::PollerAlreadyStarted);
            }
            *state = PollerState::Running;
        }

        if let Some(push) = &self.inner.push {
            if let Err(connect_error) = push.connect().await {
                error!(
                    error = ?connect_error,
                    "push listener failed to connect; relying on the poll timer"
                );
            }
        }

        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown.clone();
        *self.handle.lock() = Some(tokio::spawn(run_loop(inner, shutdown)));

        info!(
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            max_events_per_tick = self.inner.config.max_events_per_tick,
            push_enabled = self.inner.push.is_some(),
            "poller started"
        );
        Ok(())
    }

    /// Graceful shutdown: no new claim cycles, then wait for every in-flight
    /// dispatch to settle. No timeout; a handler that never completes blocks
    /// this call.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            match *state {
                PollerState::Idle => {
                    *state = PollerState::Terminated;
                    return;
                }
                PollerState::Running => *state = PollerState::ShuttingDown,
                PollerState::ShuttingDown | PollerState::Terminated => {}
            }
        }
        self.shutdown.cancel();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(join_error) = handle.await {
                error!(error = ?join_error, "poller loop task failed");
            }
        }

        *self.inner.state.lock() = PollerState::Terminated;
        info!("poller terminated");
    }
}

async fn run_loop(inner: Arc<PollerInner>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(inner.config.poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut signals: Option<BoxStream<'static, String>> =
        inner.push.as_ref().map(|push| push.signals());
    let mut throttle = SignalThrottle::new(inner.config.push_notification_throttle);
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                run_tick(&inner, &mut in_flight).await;
            }
            signal = next_signal(&mut signals) => {
                match signal {
                    Some(_) => {
                        // Any payload is just a wake-up.
                        if throttle.admit(Instant::now()) {
                            run_tick(&inner, &mut in_flight).await;
                        }
                    }
                    None => {
                        debug!("push signal stream completed");
                        signals = None;
                    }
                }
            }
            _ = trailing_wait(&throttle) => {
                throttle.fire_trailing(Instant::now());
                run_tick(&inner, &mut in_flight).await;
            }
            Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                reap(&inner, finished);
            }
        }
    }

    // Timer and stream subscription end with the loop; disconnect the
    // external listener before waiting out in-flight work.
    if let Some(push) = &inner.push {
        if let Err(disconnect_error) = push.disconnect().await {
            warn!(error = ?disconnect_error, "push listener disconnect failed");
        }
    }
    while let Some(finished) = in_flight.join_next().await {
        reap(&inner, finished);
    }
}

async fn next_signal(signals: &mut Option<BoxStream<'static, String>>) -> Option<String> {
    match signals {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn trailing_wait(throttle: &SignalThrottle) {
    match throttle.trailing_deadline() {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn reap(inner: &PollerInner, finished: Result<(), tokio::task::JoinError>) {
    if let Some(metrics) = &inner.metrics {
        metrics.in_flight.dec();
    }
    if let Err(join_error) = finished {
        error!(error = ?join_error, "record dispatch task aborted");
    }
}

async fn run_tick(inner: &Arc<PollerInner>, in_flight: &mut JoinSet<()>) {
    if *inner.state.lock() != PollerState::Running {
        return;
    }

    let batch = match inner
        .driver
        .claim_due_batch(inner.config.max_events_per_tick)
        .await
    {
        Ok(batch) => batch,
        Err(claim_error) => {
            error!(error = ?claim_error, "claim cycle failed");
            return;
        }
    };

    for record in batch.dead_lettered {
        warn!(
            event_id = record.id,
            event_name = %record.event_name,
            retry_count = record.retry_count,
            "record dead-lettered"
        );
        let ctx = DeadLetterContext::from_record(&record);
        inner.pipeline.on_dead_letter(&ctx).await;
        if let Some(metrics) = &inner.metrics {
            metrics.dead_lettered.inc();
        }
    }

    for record in batch.pending {
        let remaining: Vec<_> = inner
            .listeners
            .get(&record.event_name)
            .into_iter()
            .filter(|listener| !record.is_delivered_to(listener.name()))
            .collect();
        if remaining.is_empty() {
            continue;
        }
        // The claim resolved this name inside its transaction, so the lookup
        // cannot fail while the registry is immutable.
        let config = match inner.registry.resolve(&record.event_name) {
            Ok(config) => config.clone(),
            Err(resolve_error) => {
                error!(
                    error = ?resolve_error,
                    event_name = %record.event_name,
                    "claimed record has no configuration"
                );
                continue;
            }
        };

        if let Some(metrics) = &inner.metrics {
            metrics.in_flight.inc();
        }
        let processor = Arc::clone(&inner.processor);
        in_flight.spawn(async move {
            if let Err(dispatch_error) = processor.process(&config, record, remaining).await {
                error!(error = ?dispatch_error, "record dispatch failed");
            }
        });
    }
}

/// Leading+trailing coalescing of push signals: the first signal in a window
/// fires immediately, further signals within the window collapse into one
/// trailing fire at the window edge.
struct SignalThrottle {
    window: Duration,
    last_fire: Option<Instant>,
    trailing: bool,
}

impl SignalThrottle {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_fire: None,
            trailing: false,
        }
    }

    /// Leading edge: `true` means fire now.
    fn admit(&mut self, now: Instant) -> bool {
        match self.last_fire {
            Some(last) if now.duration_since(last) < self.window => {
                self.trailing = true;
                false
            }
            _ => {
                self.last_fire = Some(now);
                true
            }
        }
    }

    fn trailing_deadline(&self) -> Option<Instant> {
        if self.trailing {
            self.last_fire.map(|last| last + self.window)
        } else {
            None
        }
    }

    fn fire_trailing(&mut self, now: Instant) {
        self.trailing = false;
        self.last_fire = Some(now);
    }
}
