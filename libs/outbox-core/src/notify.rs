//! Optional push-notification channel: out-of-band wake-up signals that
//! shorten pickup latency. Never the delivery mechanism itself.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::OutboxResult;

/// Long-lived connection yielding opaque wake-up signals when new records
/// are inserted. The poller ignores the signal content.
///
/// Contract for implementations:
/// - `connect` is idempotent and keeps reconnecting with backoff on
///   connection loss until `disconnect` is called;
/// - `disconnect` stops reconnection permanently and completes every stream
///   previously handed out by `signals`.
#[async_trait]
pub trait PushNotificationListener: Send + Sync {
    async fn connect(&self) -> OutboxResult<()>;

    async fn disconnect(&self) -> OutboxResult<()>;

    fn signals(&self) -> BoxStream<'static, String>;
}
