//! Per-event delivery policy and module-level tuning.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{OutboxError, OutboxResult};

/// Delay policy applied by the claim operation when it extends a record's
/// `attempt_at`.
#[derive(Clone)]
pub enum RetryStrategy {
    /// Fixed delay of `ready_to_retry_after_ttl` between attempts.
    Fixed,
    /// Caller-supplied `retry_count -> delay` function.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl RetryStrategy {
    /// Capped exponential backoff: `base * 2^retry_count`, never above `cap`.
    pub fn exponential(base: Duration, cap: Duration) -> Self {
        RetryStrategy::Custom(Arc::new(move |retry_count| {
            let factor = 2u64.saturating_pow(retry_count.min(32));
            let delay_ms = (base.as_millis() as u64)
                .saturating_mul(factor)
                .min(cap.as_millis() as u64);
            Duration::from_millis(delay_ms)
        }))
    }
}

impl fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryStrategy::Fixed => f.write_str("Fixed"),
            RetryStrategy::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Delivery policy for one event type.
#[derive(Debug, Clone)]
pub struct EventConfiguration {
    pub name: String,
    /// Added to now to compute the record's `expire_at` retention hint
    pub expires_at_ttl: Duration,
    /// Initial `attempt_at` delay, and the fixed retry delay
    pub ready_to_retry_after_ttl: Duration,
    /// Per-listener invocation timeout
    pub max_execution_time_ttl: Duration,
    /// Once a claim brings `retry_count` up to this, the record dead-letters
    pub max_retries: u32,
    pub retry_strategy: RetryStrategy,
}

impl EventConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expires_at_ttl: Duration::from_secs(24 * 60 * 60),
            ready_to_retry_after_ttl: Duration::from_secs(5),
            max_execution_time_ttl: Duration::from_secs(30),
            max_retries: 5,
            retry_strategy: RetryStrategy::Fixed,
        }
    }

    /// Delay before the attempt after the `retry_count`-th one.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        match &self.retry_strategy {
            RetryStrategy::Fixed => self.ready_to_retry_after_ttl,
            RetryStrategy::Custom(strategy) => strategy(retry_count),
        }
    }
}

/// Name-keyed lookup of event configurations. Immutable after construction.
#[derive(Debug, Default)]
pub struct EventConfigRegistry {
    configs: HashMap<String, EventConfiguration>,
}

impl EventConfigRegistry {
    /// Fails with `DuplicateEventName` when two configurations share a name.
    pub fn new(configs: impl IntoIterator<Item = EventConfiguration>) -> OutboxResult<Self> {
        let mut map = HashMap::new();
        for config in configs {
            let name = config.name.clone();
            if map.insert(name.clone(), config).is_some() {
                return Err(OutboxError::DuplicateEventName(name));
            }
        }
        Ok(Self { configs: map })
    }

    pub fn resolve(&self, event_name: &str) -> OutboxResult<&EventConfiguration> {
        self.configs
            .get(event_name)
            .ok_or_else(|| OutboxError::UnknownEvent(event_name.to_string()))
    }

    pub fn contains(&self, event_name: &str) -> bool {
        self.configs.contains_key(event_name)
    }

    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Module-level tuning shared by the poller and the emitter.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Period of the poller's claim timer
    pub poll_interval: Duration,
    /// Upper bound on records claimed per tick
    pub max_events_per_tick: usize,
    /// Leading+trailing coalescing window for push-notification signals
    pub push_notification_throttle: Duration,
    /// Schedule a fire-and-forget local dispatch right after `emit` commits.
    /// The poller remains the delivery guarantee either way.
    pub dispatch_on_emit: bool,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_events_per_tick: 100,
            push_notification_throttle: Duration::from_millis(100),
            dispatch_on_emit: true,
        }
    }
}
