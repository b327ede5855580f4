//! Exception filters: secondary error sink behind `on_error`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::context::OutboxEventContext;
use crate::error::ListenerError;

/// Tagged view of the invocation that produced a failure.
#[derive(Debug, Clone, Copy)]
pub enum FilterHost<'a> {
    Outbox(&'a OutboxEventContext),
}

impl<'a> FilterHost<'a> {
    pub fn as_outbox_context(&self) -> Option<&'a OutboxEventContext> {
        match self {
            FilterHost::Outbox(ctx) => Some(ctx),
        }
    }
}

/// Invoked once per listener failure, after the `on_error` middlewares.
#[async_trait]
pub trait ExceptionFilter: Send + Sync {
    async fn catch(&self, error: &ListenerError, host: FilterHost<'_>) -> anyhow::Result<()>;
}

/// Ordered filter chain. A filter's own failure is logged and the next
/// filter still runs.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn ExceptionFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn ExceptionFilter>>) -> Self {
        Self { filters }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub async fn dispatch(&self, error: &ListenerError, ctx: &OutboxEventContext) {
        for filter in &self.filters {
            if let Err(filter_error) = filter.catch(error, FilterHost::Outbox(ctx)).await {
                warn!(
                    event_id = ctx.event_id,
                    listener = %ctx.listener_name,
                    error = ?filter_error,
                    "exception filter failed"
                );
            }
        }
    }
}
