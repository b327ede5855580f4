//! LISTEN-based push notifications: a long-lived connection that turns the
//! insert trigger's NOTIFY into wake-up signals for the poller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use outbox_core::{OutboxResult, PushNotificationListener};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Channel the insert trigger notifies on.
pub const DEFAULT_NOTIFY_CHANNEL: &str = "inbox_outbox_event";

const SIGNAL_BUFFER: usize = 64;

/// Push-notification listener over PostgreSQL LISTEN/NOTIFY.
///
/// `connect` is idempotent and spawns one background task that holds the
/// listening connection, forwarding each notification payload (the new
/// row's id, though subscribers treat it as opaque) into every stream from
/// `signals`. On transport errors the task reconnects after
/// `reconnect_delay` until `disconnect`, which is permanent and completes
/// the signal streams.
pub struct PgNotifyListener {
    pool: PgPool,
    channel: String,
    reconnect_delay: Duration,
    sender: broadcast::Sender<String>,
    shutdown: CancellationToken,
    connected: AtomicBool,
}

impl PgNotifyListener {
    pub fn new(pool: PgPool) -> Self {
        let (sender, _) = broadcast::channel(SIGNAL_BUFFER);
        Self {
            pool,
            channel: DEFAULT_NOTIFY_CHANNEL.to_string(),
            reconnect_delay: Duration::from_secs(5),
            sender,
            shutdown: CancellationToken::new(),
            connected: AtomicBool::new(false),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

#[async_trait]
impl PushNotificationListener for PgNotifyListener {
    async fn connect(&self) -> OutboxResult<()> {
        if self.shutdown.is_cancelled() {
            warn!("push listener was disconnected; not reconnecting");
            return Ok(());
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let pool = self.pool.clone();
        let channel = self.channel.clone();
        let sender = self.sender.clone();
        let reconnect_delay = self.reconnect_delay;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                match PgListener::connect_with(&pool).await {
                    Ok(mut pg_listener) => match pg_listener.listen(&channel).await {
                        Ok(()) => {
                            info!(channel = %channel, "push listener connected");
                            loop {
                                tokio::select! {
                                    _ = shutdown.cancelled() => return,
                                    message = pg_listener.try_recv() => match message {
                                        Ok(Some(notification)) => {
                                            let _ = sender.send(notification.payload().to_string());
                                        }
                                        Ok(None) => {}
                                        Err(transport_error) => {
                                            warn!(
                                                error = ?transport_error,
                                                "push listener transport error, reconnecting"
                                            );
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                        Err(listen_error) => {
                            error!(error = ?listen_error, channel = %channel, "LISTEN failed");
                        }
                    },
                    Err(connect_error) => {
                        error!(error = ?connect_error, "push listener failed to connect");
                    }
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        });
        Ok(())
    }

    async fn disconnect(&self) -> OutboxResult<()> {
        // Permanent: stops reconnection and completes every signal stream.
        self.shutdown.cancel();
        Ok(())
    }

    fn signals(&self) -> BoxStream<'static, String> {
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(|item| futures::future::ready(item.ok()));
        Box::pin(stream.take_until(self.shutdown.clone().cancelled_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener() -> PgNotifyListener {
        let pool = PgPool::connect_lazy("postgresql://localhost/outbox_test")
            .expect("lazy pool construction");
        PgNotifyListener::new(pool)
            .with_channel("custom_channel")
            .with_reconnect_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn signals_forward_payloads_to_every_subscriber() {
        let listener = listener();
        let mut first = listener.signals();
        let mut second = listener.signals();

        listener.sender.send("41".to_string()).unwrap();
        listener.sender.send("42".to_string()).unwrap();

        assert_eq!(first.next().await.as_deref(), Some("41"));
        assert_eq!(first.next().await.as_deref(), Some("42"));
        assert_eq!(second.next().await.as_deref(), Some("41"));
    }

    #[tokio::test]
    async fn disconnect_completes_open_and_future_streams() {
        let listener = listener();
        let mut open = listener.signals();

        listener.disconnect().await.unwrap();
        assert_eq!(open.next().await, None);
        assert_eq!(listener.signals().next().await, None);

        // Reconnecting after disconnect is a no-op.
        listener.connect().await.unwrap();
        assert_eq!(listener.signals().next().await, None);
    }
}
