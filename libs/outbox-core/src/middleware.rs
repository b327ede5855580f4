//! Middleware pipeline: ordered interceptors around listener execution and
//! lifecycle events.
//!
//! Hook isolation: errors from observer hooks (`before_process`,
//! `after_process`, `on_error`, `on_dead_letter`) are caught and logged here
//! so one middleware never stops the chain, the listener, or persistence.
//! `before_emit` errors propagate (they fire before durability), and a
//! `wrap_execution` error counts as a listener failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{error, warn};

use crate::context::{DeadLetterContext, EmittedEvent, OutboxEventContext};
use crate::error::ListenerError;

/// Outcome of one listener invocation, success or failure, handed to
/// `after_process`.
#[derive(Debug)]
pub struct ExecutionResult {
    pub success: bool,
    pub error: Option<ListenerError>,
    /// Wall clock from invocation start, in milliseconds
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(duration: Duration) -> Self {
        Self {
            success: true,
            error: None,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn failure(error: ListenerError, duration: Duration) -> Self {
        Self {
            success: false,
            error: Some(error),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Continuation handed to `wrap_execution`: the rest of the wrapper chain and
/// ultimately the listener itself. Consumed by value, so a wrapper can run it
/// at most once.
pub struct Next<'a> {
    inner: BoxFuture<'a, Result<(), ListenerError>>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(inner: BoxFuture<'a, Result<(), ListenerError>>) -> Self {
        Self { inner }
    }

    pub async fn run(self) -> Result<(), ListenerError> {
        self.inner.await
    }
}

/// Interceptor registered once globally. Implement any subset of the hooks;
/// the defaults are pass-throughs.
#[async_trait]
pub trait OutboxMiddleware: Send + Sync {
    /// May transform the event before the outbox record is built. Errors
    /// abort the emit; nothing is persisted.
    async fn before_emit(&self, event: EmittedEvent) -> anyhow::Result<EmittedEvent> {
        Ok(event)
    }

    /// Observer invoked before each listener invocation.
    async fn before_process(&self, _ctx: &OutboxEventContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Observer invoked after each listener invocation, success or failure.
    async fn after_process(
        &self,
        _ctx: &OutboxEventContext,
        _result: &ExecutionResult,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked when a listener fails or times out, before exception filters.
    async fn on_error(&self, _ctx: &OutboxEventContext, _error: &ListenerError) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked once per newly dead-lettered record.
    async fn on_dead_letter(&self, _ctx: &DeadLetterContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Wraps the listener call. Must run `next` at most once; an error here
    /// is treated as a listener failure.
    async fn wrap_execution<'a>(
        &'a self,
        _ctx: &'a OutboxEventContext,
        next: Next<'a>,
    ) -> Result<(), ListenerError> {
        next.run().await
    }
}

/// Ordered middleware chain. Observer hooks iterate in registration order;
/// `wrap_execution` composes with the first-registered wrapper outermost.
#[derive(Default)]
pub struct MiddlewarePipeline {
    middlewares: Vec<Arc<dyn OutboxMiddleware>>,
}

impl MiddlewarePipeline {
    pub fn new(middlewares: Vec<Arc<dyn OutboxMiddleware>>) -> Self {
        Self { middlewares }
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Left fold in registration order: each middleware sees the previous
    /// one's output. The first error aborts the emit.
    pub async fn before_emit(&self, mut event: EmittedEvent) -> anyhow::Result<EmittedEvent> {
        for middleware in &self.middlewares {
            event = middleware.before_emit(event).await?;
        }
        Ok(event)
    }

    pub async fn before_process(&self, ctx: &OutboxEventContext) {
        for middleware in &self.middlewares {
            if let Err(hook_error) = middleware.before_process(ctx).await {
                warn!(
                    event_id = ctx.event_id,
                    listener = %ctx.listener_name,
                    error = ?hook_error,
                    "before_process middleware failed"
                );
            }
        }
    }

    pub async fn after_process(&self, ctx: &OutboxEventContext, result: &ExecutionResult) {
        for middleware in &self.middlewares {
            if let Err(hook_error) = middleware.after_process(ctx, result).await {
                warn!(
                    event_id = ctx.event_id,
                    listener = %ctx.listener_name,
                    error = ?hook_error,
                    "after_process middleware failed"
                );
            }
        }
    }

    pub async fn on_error(&self, ctx: &OutboxEventContext, listener_error: &ListenerError) {
        for middleware in &self.middlewares {
            if let Err(hook_error) = middleware.on_error(ctx, listener_error).await {
                warn!(
                    event_id = ctx.event_id,
                    listener = %ctx.listener_name,
                    error = ?hook_error,
                    "on_error middleware failed"
                );
            }
        }
    }

    pub async fn on_dead_letter(&self, ctx: &DeadLetterContext) {
        for middleware in &self.middlewares {
            if let Err(hook_error) = middleware.on_dead_letter(ctx).await {
                error!(
                    event_id = ctx.event_id,
                    event_name = %ctx.event_name,
                    error = ?hook_error,
                    "on_dead_letter middleware failed"
                );
            }
        }
    }

    /// Nest `terminal` inside every wrapper, first-registered outermost.
    pub fn wrap_execution<'a>(
        &'a self,
        ctx: &'a OutboxEventContext,
        terminal: BoxFuture<'a, Result<(), ListenerError>>,
    ) -> BoxFuture<'a, Result<(), ListenerError>> {
        let mut chain = terminal;
        for middleware in self.middlewares.iter().rev() {
            let next = Next::new(chain);
            chain = middleware.wrap_execution(ctx, next);
        }
        chain
    }
}
