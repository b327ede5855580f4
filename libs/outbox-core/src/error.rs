//! Error types for the outbox engine.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// The emitter was asked to emit an event type that was never configured
    #[error("event not configured: {0}")]
    UnconfiguredEvent(String),

    /// A stored record references an event type the registry does not know
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// Two event configurations were registered under the same name
    #[error("duplicate event name: {0}")]
    DuplicateEventName(String),

    /// Two listeners with the same stable name were registered for one event
    #[error("duplicate listener '{listener}' for event '{event}'")]
    DuplicateListenerName { event: String, listener: String },

    /// A `before_emit` middleware failed; nothing was persisted
    #[error("before_emit middleware failed: {0}")]
    BeforeEmit(#[source] anyhow::Error),

    /// The unit of work was handed an entity the driver cannot write
    #[error("entity not supported by this driver")]
    UnsupportedEntity,

    /// The poller was started twice
    #[error("poller already started")]
    PollerAlreadyStarted,

    /// The engine was assembled without a required part
    #[error("outbox misconfigured: {0}")]
    Misconfigured(&'static str),

    /// Storage transport failure
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OutboxError {
    /// Wrap a driver transport error.
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        OutboxError::Storage(err.into())
    }
}

/// Failure of a single listener invocation. Contained per listener: other
/// listeners for the same record still run.
#[derive(Error, Debug)]
pub enum ListenerError {
    /// The listener returned an error
    #[error("listener failed: {0}")]
    Failed(#[source] anyhow::Error),

    /// The listener did not settle within `max_execution_time_ttl`
    #[error("listener timed out after {0:?}")]
    TimedOut(Duration),
}

impl ListenerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ListenerError::TimedOut(_))
    }
}

impl From<anyhow::Error> for ListenerError {
    fn from(err: anyhow::Error) -> Self {
        ListenerError::Failed(err)
    }
}
