//! Recording fakes for the fabric's seams, shared by unit and integration
//! tests.

use crate::dispatch::{self, DispatchChannel, DispatchError, DispatchRouter, PubSubTransport};
use crate::framing::FrameDecoder;
use crate::push::{PushError, PushNotification, PushNotifier};
use crate::websocket::ClientSession;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// In-process stand-in for the cache service.
///
/// Publishes to channels the router holds are routed back through the router
/// on a separate task, in order, like the real receive loop does. Channels
/// marked remote count as receivers without being routed.
#[derive(Default)]
pub struct LoopbackTransport {
    subscribed: Mutex<HashSet<String>>,
    remote: Mutex<HashSet<String>>,
    subscribe_commands: Mutex<HashMap<String, usize>>,
    unsubscribe_commands: Mutex<HashMap<String, usize>>,
    published: Mutex<Vec<(String, Bytes)>>,
    inbox: Mutex<Option<mpsc::UnboundedSender<(String, Bytes)>>>,
    fail_publish: AtomicBool,
    publish_delay: Mutex<Duration>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretends another process holds `channel`.
    pub fn add_remote_subscriber(&self, channel: &str) {
        lock(&self.remote).insert(channel.to_string());
    }

    /// Makes every publish fail with a transport error.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Holds every publish for `delay` before it takes effect.
    pub fn delay_publishes(&self, delay: Duration) {
        *lock(&self.publish_delay) = delay;
    }

    /// Delivers `data` on `channel` as if the cache service pushed it,
    /// whether or not the channel is subscribed.
    pub fn inject(&self, channel: &str, data: &[u8]) {
        if let Some(inbox) = lock(&self.inbox).as_ref() {
            let _ = inbox.send((channel.to_string(), Bytes::copy_from_slice(data)));
        }
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        lock(&self.subscribed).contains(channel)
    }

    pub fn subscribe_count(&self, channel: &str) -> usize {
        lock(&self.subscribe_commands).get(channel).copied().unwrap_or(0)
    }

    pub fn unsubscribe_count(&self, channel: &str) -> usize {
        lock(&self.unsubscribe_commands).get(channel).copied().unwrap_or(0)
    }

    pub fn published(&self) -> Vec<(String, Bytes)> {
        lock(&self.published).clone()
    }

    pub fn published_to(&self, channel: &str) -> Vec<Bytes> {
        lock(&self.published)
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, data)| data.clone())
            .collect()
    }
}

#[async_trait]
impl PubSubTransport for LoopbackTransport {
    fn start(&self, router: Arc<dyn DispatchRouter>) {
        let router: Weak<dyn DispatchRouter> = Arc::downgrade(&router);
        let (sender, mut receiver) = mpsc::unbounded_channel::<(String, Bytes)>();
        *lock(&self.inbox) = Some(sender);

        tokio::spawn(async move {
            while let Some((channel, data)) = receiver.recv().await {
                let Some(router) = router.upgrade() else {
                    break;
                };
                router.route(&channel, &data).await;
            }
        });
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> dispatch::Result<u64> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(DispatchError::Closed);
        }
        let delay = *lock(&self.publish_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let payload = Bytes::copy_from_slice(payload);
        lock(&self.published).push((channel.to_string(), payload.clone()));

        let mut receivers = 0;
        if lock(&self.remote).contains(channel) {
            receivers += 1;
        }
        if self.is_subscribed(channel) {
            receivers += 1;
            self.inject(channel, &payload);
        }
        Ok(receivers)
    }

    async fn sync_subscription(
        &self,
        channel: &str,
        router: &dyn DispatchRouter,
    ) -> dispatch::Result<()> {
        let commands = if router.is_subscribed(channel) {
            lock(&self.subscribed).insert(channel.to_string());
            &self.subscribe_commands
        } else {
            lock(&self.subscribed).remove(channel);
            &self.unsubscribe_commands
        };
        *lock(commands).entry(channel.to_string()).or_default() += 1;
        Ok(())
    }

    async fn shutdown(&self) {
        lock(&self.inbox).take();
    }
}

/// Channel handler that remembers everything it was handed.
#[derive(Default)]
pub struct RecordingChannel {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingChannel {
    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl DispatchChannel for RecordingChannel {
    async fn on_dispatch_message(&self, channel: &str, data: &[u8]) {
        lock(&self.messages).push((channel.to_string(), data.to_vec()));
    }
}

/// Push gateway that records notifications and answers with a fixed result.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<PushNotification>>,
    failure: Mutex<Option<PushError>>,
}

impl RecordingNotifier {
    pub fn failing_with(error: PushError) -> Self {
        Self {
            failure: Mutex::new(Some(error)),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<PushNotification> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl PushNotifier for RecordingNotifier {
    async fn send_push(&self, notification: PushNotification) -> Result<(), PushError> {
        lock(&self.sent).push(notification);
        match lock(&self.failure).clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Client session that decodes and keeps every frame written to it.
pub struct RecordingSession {
    decoder: Mutex<FrameDecoder>,
    frames: Mutex<Vec<Bytes>>,
    fail_writes: AtomicBool,
    disconnected: AtomicBool,
    gate: watch::Sender<bool>,
}

impl Default for RecordingSession {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            decoder: Mutex::new(FrameDecoder::new()),
            frames: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            gate,
        }
    }
}

impl RecordingSession {
    pub fn frames(&self) -> Vec<Bytes> {
        lock(&self.frames).clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Blocks writes until [`RecordingSession::release`].
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientSession for RecordingSession {
    async fn send(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("session write failed"));
        }

        let mut decoder = lock(&self.decoder);
        decoder.feed(frame);
        while let Some(decoded) = decoder.decode_frame() {
            lock(&self.frames).push(decoded);
        }
        Ok(())
    }

    /// Like a closed socket: pending and later writes fail.
    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.fail_writes.store(true, Ordering::SeqCst);
        self.gate.send_replace(true);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
