use super::connection::{PubSubReply, Reply, ReplyReader};
use super::publisher::PublisherPool;
use super::{
    CacheConnector, CacheReader, CacheWriter, DispatchError, DispatchRouter, PubSubTransport,
    Result,
};
use async_trait::async_trait;
use dispatchcore::resp::{ping_command, subscribe_command, unsubscribe_command};
use log::{debug, error, info, trace, warn};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, watch};
use tokio::time::sleep;

// Keeps a single SUBSCRIBE command at a reasonable size when resubscribing.
const RESUBSCRIBE_BATCH: usize = 512;

/// Dials the cache service over plain TCP.
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl CacheConnector for TcpConnector {
    async fn connect(&self) -> Result<(CacheReader, CacheWriter)> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    }
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub publisher_pool_size: usize,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// PING period on the subscribe connection, used to notice dead sockets.
    pub ping_interval: Option<Duration>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            publisher_pool_size: 8,
            reconnect_initial: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(30),
            ping_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl TransportOptions {
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .reconnect_initial
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.reconnect_max);
        let jitter_ms = (base.as_millis() / 4) as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// The subscribe connection's write half, together with the signal the
/// receive loop waits on when a write fails.
struct Subscriber {
    writer: CacheWriter,
    broken: Arc<Notify>,
}

struct Inner {
    connector: Arc<dyn CacheConnector>,
    publishers: PublisherPool,
    options: TransportOptions,
    subscriber: Mutex<Option<Subscriber>>,
    is_running: AtomicBool,
    reconnect_errors: AtomicU32,
    sessions: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Pub/sub transport over the cache service: one long-lived subscribe
/// connection with its own receive loop, plus a pool of publish connections.
///
/// The subscribe connection is re-established with backoff whenever it fails,
/// and every channel the router holds is subscribed again before any other
/// subscription change is written to the new connection.
#[derive(Clone)]
pub struct RedisDispatchTransport {
    inner: Arc<Inner>,
}

impl RedisDispatchTransport {
    pub fn new(connector: Arc<dyn CacheConnector>, options: TransportOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        let publishers = PublisherPool::new(connector.clone(), options.publisher_pool_size);
        Self {
            inner: Arc::new(Inner {
                connector,
                publishers,
                options,
                subscriber: Mutex::new(None),
                is_running: AtomicBool::new(false),
                reconnect_errors: AtomicU32::new(0),
                sessions: AtomicU64::new(0),
                shutdown,
            }),
        }
    }

    pub fn tcp(address: impl Into<String>, options: TransportOptions) -> Self {
        Self::new(Arc::new(TcpConnector::new(address)), options)
    }

    /// Number of subscribe connections established so far.
    pub fn sessions(&self) -> u64 {
        self.inner.sessions.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.subscriber.lock().await.is_some()
    }
}

#[async_trait]
impl PubSubTransport for RedisDispatchTransport {
    fn start(&self, router: Arc<dyn DispatchRouter>) {
        if self.inner.is_running.swap(true, Ordering::SeqCst) {
            warn!(target: "Dispatch/Subscribe", "Transport `start` called while already running.");
            return;
        }
        tokio::spawn(self.inner.clone().run(router));
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64> {
        self.inner.publishers.publish(channel, payload).await
    }

    async fn sync_subscription(&self, channel: &str, router: &dyn DispatchRouter) -> Result<()> {
        self.inner.sync_subscription(channel, router).await
    }

    async fn shutdown(&self) {
        if !self.inner.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(target: "Dispatch/Subscribe", "Shutting down transport");
        self.inner.shutdown.send_replace(true);
        if let Some(mut subscriber) = self.inner.subscriber.lock().await.take() {
            let _ = subscriber.writer.shutdown().await;
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>, router: Arc<dyn DispatchRouter>) {
        let _guard = scopeguard::guard((), |_| {
            self.is_running.store(false, Ordering::Relaxed);
        });
        let mut shutdown = self.shutdown.subscribe();

        while self.is_running.load(Ordering::Relaxed) {
            match self.open_session(router.as_ref()).await {
                Ok((mut reader, broken)) => {
                    self.reconnect_errors.store(0, Ordering::Relaxed);

                    let result = tokio::select! {
                        r = self.read_loop(&mut reader, router.as_ref()) => r,
                        r = self.keepalive_loop() => r,
                        _ = broken.notified() => Err(DispatchError::Closed),
                        _ = stopped(&mut shutdown) => Ok(()),
                    };

                    match result {
                        Ok(()) => debug!(target: "Dispatch/Subscribe", "Receive loop stopped."),
                        Err(e) => warn!(target: "Dispatch/Subscribe", "Subscribe connection lost: {e}"),
                    }
                    self.subscriber.lock().await.take();
                }
                Err(e) => error!(target: "Dispatch/Subscribe", "Failed to connect to cache service: {e}"),
            }

            if !self.is_running.load(Ordering::Relaxed) {
                break;
            }

            let attempt = self.reconnect_errors.fetch_add(1, Ordering::SeqCst);
            let delay = self.options.backoff(attempt);
            info!(target: "Dispatch/Subscribe", "Will attempt to reconnect in {delay:?} (attempt {})", attempt + 1);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = stopped(&mut shutdown) => break,
            }
        }
        info!(target: "Dispatch/Subscribe", "Transport run loop has shut down.");
    }

    /// Connects, resubscribes everything the router holds and installs the
    /// writer. Subscription changes wait on the writer lock meanwhile, so none
    /// of them can be overtaken by the resubscribe.
    async fn open_session(
        &self,
        router: &dyn DispatchRouter,
    ) -> Result<(ReplyReader<CacheReader>, Arc<Notify>)> {
        let (reader, mut writer) = self.connector.connect().await?;
        let mut slot = self.subscriber.lock().await;

        let channels = router.subscribed_channels();
        for batch in channels.chunks(RESUBSCRIBE_BATCH) {
            let batch: Vec<&str> = batch.iter().map(String::as_str).collect();
            writer.write_all(&subscribe_command(&batch)).await?;
        }
        writer.flush().await?;

        let broken = Arc::new(Notify::new());
        *slot = Some(Subscriber {
            writer,
            broken: broken.clone(),
        });
        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            target: "Dispatch/Subscribe",
            "Subscribe connection {session} established, resubscribed {} channels",
            channels.len()
        );

        Ok((ReplyReader::new(reader), broken))
    }

    async fn read_loop(
        &self,
        reader: &mut ReplyReader<CacheReader>,
        router: &dyn DispatchRouter,
    ) -> Result<()> {
        loop {
            let reply = reader.read_reply().await?.ok_or(DispatchError::Closed)?;

            match PubSubReply::try_from(reply)? {
                PubSubReply::Message { channel, data } => {
                    trace!(target: "Dispatch/Subscribe", "Message on {channel} ({} bytes)", data.len());
                    router.route(&channel, &data).await;
                }
                PubSubReply::Subscribed { channel, count } => {
                    debug!(target: "Dispatch/Subscribe", "Subscribed to {channel} ({count} total)");
                    router.on_subscription_confirmed(&channel, true);
                }
                PubSubReply::Unsubscribed { channel, count } => {
                    debug!(target: "Dispatch/Subscribe", "Unsubscribed from {channel} ({count} total)");
                    router.on_subscription_confirmed(&channel, false);
                }
                PubSubReply::Pong => trace!(target: "Dispatch/Subscribe", "Received pong"),
                PubSubReply::Other(Reply::Error(message)) => {
                    warn!(target: "Dispatch/Subscribe", "Cache service error on subscribe connection: {message}");
                }
                PubSubReply::Other(other) => {
                    warn!(target: "Dispatch/Subscribe", "Ignoring unexpected reply: {other:?}");
                }
            }
        }
    }

    /// Only returns on a failed PING write.
    async fn keepalive_loop(&self) -> Result<()> {
        let Some(interval) = self.options.ping_interval else {
            return std::future::pending().await;
        };
        loop {
            sleep(interval).await;
            let mut slot = self.subscriber.lock().await;
            let Some(subscriber) = slot.as_mut() else {
                return Err(DispatchError::Closed);
            };
            if let Err(e) = write_command(&mut subscriber.writer, &ping_command()).await {
                slot.take();
                return Err(e);
            }
        }
    }

    async fn sync_subscription(&self, channel: &str, router: &dyn DispatchRouter) -> Result<()> {
        let mut slot = self.subscriber.lock().await;
        let Some(subscriber) = slot.as_mut() else {
            debug!(target: "Dispatch/Subscribe", "Not connected, {channel} will be synced on reconnect");
            return Ok(());
        };

        let command = if router.is_subscribed(channel) {
            subscribe_command(&[channel])
        } else {
            unsubscribe_command(&[channel])
        };

        if let Err(e) = write_command(&mut subscriber.writer, &command).await {
            if let Some(subscriber) = slot.take() {
                subscriber.broken.notify_one();
            }
            return Err(e);
        }
        Ok(())
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn write_command(writer: &mut CacheWriter, command: &[u8]) -> Result<()> {
    writer.write_all(command).await?;
    writer.flush().await?;
    Ok(())
}
