use super::{ApnMessage, MAX_EXPIRATION, PushError, PushNotification, PushNotifier};
use crate::dispatch::DispatchChannel;
use crate::pubsub::PubSubManager;
use async_trait::async_trait;
use dashmap::DashMap;
use dispatchcore::{ConnectionInfoAddress, DeviceAddress, PubSubEvent};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

const SCHEDULED_WAKE: u8 = 0;
const SCHEDULED_STANDARD: u8 = 1;
const FIRED: u8 = 2;
const CANCELLED: u8 = 3;

const MAX_PUSH_ATTEMPTS: u32 = 3;
const PUSH_RETRY_DELAY: Duration = Duration::from_millis(200);

/// A pending APN fallback: wake the device with a VoIP push after `delay`,
/// then follow up with a standard push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackTask {
    pub apn_id: String,
    pub voip_apn_id: String,
    pub message: ApnMessage,
    pub delay: Duration,
    /// Delivery attempts already spent on this message.
    pub attempt: u32,
}

impl FallbackTask {
    pub fn new(
        apn_id: impl Into<String>,
        voip_apn_id: impl Into<String>,
        message: ApnMessage,
        delay: Duration,
    ) -> Self {
        Self {
            apn_id: apn_id.into(),
            voip_apn_id: voip_apn_id.into(),
            message,
            delay,
            attempt: 0,
        }
    }

    fn wake_message(&self) -> ApnMessage {
        ApnMessage {
            apn_id: self.voip_apn_id.clone(),
            is_voip: true,
            ..self.message.clone()
        }
    }

    fn standard_message(&self) -> ApnMessage {
        ApnMessage {
            apn_id: self.apn_id.clone(),
            is_voip: false,
            expiration: MAX_EXPIRATION,
            ..self.message.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackState {
    ScheduledWake,
    ScheduledStandard,
    Fired,
    Cancelled,
}

impl From<u8> for FallbackState {
    fn from(value: u8) -> Self {
        match value {
            SCHEDULED_WAKE => Self::ScheduledWake,
            SCHEDULED_STANDARD => Self::ScheduledStandard,
            FIRED => Self::Fired,
            _ => Self::Cancelled,
        }
    }
}

struct PendingFallback {
    address: DeviceAddress,
    task: FallbackTask,
    state: AtomicU8,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PendingFallback {
    fn advance(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves a scheduled fallback to `Cancelled`. Fails once it has fired or
    /// was already cancelled.
    fn cancel(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        while current == SCHEDULED_WAKE || current == SCHEDULED_STANDARD {
            match self.state.compare_exchange(
                current,
                CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    fn set_timer(&self, handle: JoinHandle<()>) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(previous) = timer.replace(handle) {
                previous.abort();
            }
        }
    }

    fn take_timer(&self) -> Option<JoinHandle<()>> {
        self.timer.lock().ok().and_then(|mut timer| timer.take())
    }

    fn abort_timer(&self) {
        if let Some(timer) = self.take_timer() {
            timer.abort();
        }
    }
}

/// Observes one scheduled fallback.
#[derive(Clone)]
pub struct FallbackHandle {
    entry: Arc<PendingFallback>,
}

impl FallbackHandle {
    pub fn state(&self) -> FallbackState {
        FallbackState::from(self.entry.state.load(Ordering::Acquire))
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.entry.address
    }
}

/// Schedules APN wake-up pushes for devices that were offline when a message
/// arrived, and cancels them when the device connects.
///
/// While a fallback is pending the scheduler holds the device's
/// connection-info channel; a CONNECTED event there cancels the fallback.
pub struct FallbackScheduler {
    weak_self: Weak<FallbackScheduler>,
    notifier: Arc<dyn PushNotifier>,
    pubsub: Arc<PubSubManager>,
    pending: DashMap<DeviceAddress, Arc<PendingFallback>>,
    reconcile_lock: tokio::sync::Mutex<()>,
    standard_delay: Option<Duration>,
}

impl FallbackScheduler {
    pub fn new(
        notifier: Arc<dyn PushNotifier>,
        pubsub: Arc<PubSubManager>,
        standard_delay: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            notifier,
            pubsub,
            pending: DashMap::new(),
            reconcile_lock: tokio::sync::Mutex::new(()),
            standard_delay,
        })
    }

    /// Schedules `task` for `address`, superseding any fallback still pending
    /// for it.
    pub async fn schedule(&self, address: &DeviceAddress, task: FallbackTask) -> FallbackHandle {
        let delay = task.delay;
        let entry = Arc::new(PendingFallback {
            address: address.clone(),
            task,
            state: AtomicU8::new(SCHEDULED_WAKE),
            timer: Mutex::new(None),
        });

        if let Some(previous) = self.pending.insert(address.clone(), entry.clone())
            && previous.cancel()
        {
            previous.abort_timer();
            debug!(target: "Dispatch/Fallback", "Superseded pending fallback for {address}");
        }

        self.reconcile(address).await;
        self.arm(&entry, delay, SCHEDULED_WAKE);
        info!(target: "Dispatch/Fallback", "Scheduled fallback for {address} in {delay:?}");

        FallbackHandle { entry }
    }

    /// Cancels the fallback pending for `address`, if any.
    pub async fn cancel(&self, address: &DeviceAddress) -> bool {
        let Some(entry) = self.pending.get(address).map(|e| e.value().clone()) else {
            return false;
        };
        if !entry.cancel() {
            return false;
        }

        entry.abort_timer();
        debug!(target: "Dispatch/Fallback", "Cancelled fallback for {address}");
        self.finish(&entry).await;
        true
    }

    pub fn is_pending(&self, address: &DeviceAddress) -> bool {
        self.pending.contains_key(address)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn arm(&self, entry: &Arc<PendingFallback>, delay: Duration, stage: u8) {
        let weak = self.weak_self.clone();
        let timer_entry = entry.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let Some(scheduler) = weak.upgrade() else {
                return;
            };
            match stage {
                SCHEDULED_WAKE => scheduler.fire_wake(timer_entry).await,
                _ => scheduler.fire_standard(timer_entry).await,
            }
        });
        entry.set_timer(handle);
    }

    async fn fire_wake(&self, entry: Arc<PendingFallback>) {
        if !entry.advance(SCHEDULED_WAKE, SCHEDULED_STANDARD) {
            return;
        }
        entry.take_timer();

        let address = &entry.address;
        debug!(target: "Dispatch/Fallback", "Sending wake push to {address}");
        match self
            .notifier
            .send_push(PushNotification::Apn(entry.task.wake_message()))
            .await
        {
            Ok(()) => {}
            Err(PushError::NotRegistered(id)) => {
                warn!(target: "Dispatch/Fallback", "Wake id {id} of {address} is not registered");
            }
            Err(e) => warn!(target: "Dispatch/Fallback", "Wake push to {address} failed: {e}"),
        }

        let delay = self.standard_delay.unwrap_or(entry.task.delay / 2);
        self.arm(&entry, delay, SCHEDULED_STANDARD);
    }

    async fn fire_standard(&self, entry: Arc<PendingFallback>) {
        if !entry.advance(SCHEDULED_STANDARD, FIRED) {
            return;
        }
        entry.take_timer();

        let address = &entry.address;
        let message = entry.task.standard_message();
        let mut attempt = entry.task.attempt;
        loop {
            attempt += 1;
            match self
                .notifier
                .send_push(PushNotification::Apn(message.clone()))
                .await
            {
                Ok(()) => {
                    info!(target: "Dispatch/Fallback", "Fallback for {address} fired");
                    break;
                }
                Err(PushError::NotRegistered(id)) => {
                    warn!(target: "Dispatch/Fallback", "Push id {id} of {address} is not registered");
                    break;
                }
                Err(e) if attempt < MAX_PUSH_ATTEMPTS => {
                    warn!(target: "Dispatch/Fallback", "Standard push to {address} failed (attempt {attempt}): {e}");
                    sleep(PUSH_RETRY_DELAY).await;
                }
                Err(e) => {
                    warn!(target: "Dispatch/Fallback", "Giving up on standard push to {address}: {e}");
                    break;
                }
            }
        }

        self.finish(&entry).await;
    }

    async fn finish(&self, entry: &Arc<PendingFallback>) {
        self.pending
            .remove_if(&entry.address, |_, current| Arc::ptr_eq(current, entry));
        self.reconcile(&entry.address).await;
    }

    /// Holds the connection-info subscription exactly while a fallback is
    /// pending for `address`.
    async fn reconcile(&self, address: &DeviceAddress) {
        let _guard = self.reconcile_lock.lock().await;
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };

        let info = address.connection_info();
        let wanted = self.pending.contains_key(address);
        let held = self.pubsub.is_subscribed_by(&info, this.as_ref());

        if wanted && !held {
            if let Err(e) = self.pubsub.subscribe(&info, this).await {
                warn!(target: "Dispatch/Fallback", "Could not watch {info}: {e}");
            }
        } else if !wanted && held {
            self.pubsub.unsubscribe(&info, this.as_ref()).await;
        }
    }
}

#[async_trait]
impl DispatchChannel for FallbackScheduler {
    async fn on_dispatch_message(&self, channel: &str, data: &[u8]) {
        let info = match channel.parse::<ConnectionInfoAddress>() {
            Ok(info) => info,
            Err(e) => {
                warn!(target: "Dispatch/Fallback", "Unexpected channel {channel}: {e}");
                return;
            }
        };

        match PubSubEvent::decode(data) {
            Ok(PubSubEvent::Connected) => {
                self.cancel(info.device_address()).await;
            }
            Ok(other) => debug!(target: "Dispatch/Fallback", "Ignoring {other:?} on {channel}"),
            Err(e) => warn!(target: "Dispatch/Fallback", "Bad pubsub message on {channel}: {e}"),
        }
    }

    fn on_dispatch_unsubscribed(&self, channel: &str) {
        debug!(target: "Dispatch/Fallback", "Stopped watching {channel}");
    }
}
