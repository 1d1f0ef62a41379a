use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use whisper_dispatch::push::{
    ApnMessage, FallbackScheduler, FallbackState, FallbackTask, MAX_EXPIRATION, PushError,
    PushNotification,
};
use whisper_dispatch::test_utils::{LoopbackTransport, RecordingNotifier, wait_until};
use whisper_dispatch::{DeviceAddress, PubSubEvent, PubSubManager};

const INFO_CHANNEL: &str = "+14152222223:1:c";

fn apn_message() -> ApnMessage {
    ApnMessage {
        apn_id: "bar".into(),
        number: "123".into(),
        device_id: 1,
        message: "hmm".into(),
        is_voip: true,
        expiration: 1111,
    }
}

fn task(delay_ms: u64) -> FallbackTask {
    FallbackTask::new(
        "foo",
        "voipfoo",
        apn_message(),
        Duration::from_millis(delay_ms),
    )
}

fn setup(
    notifier: RecordingNotifier,
    standard_delay: Option<Duration>,
) -> (
    Arc<LoopbackTransport>,
    Arc<PubSubManager>,
    Arc<RecordingNotifier>,
    Arc<FallbackScheduler>,
) {
    let _ = env_logger::builder().is_test(true).try_init();

    let transport = Arc::new(LoopbackTransport::new());
    let pubsub = Arc::new(PubSubManager::new(transport.clone(), None));
    pubsub.start();
    let notifier = Arc::new(notifier);
    let scheduler = FallbackScheduler::new(notifier.clone(), pubsub.clone(), standard_delay);
    (transport, pubsub, notifier, scheduler)
}

fn apn(notification: &PushNotification) -> &ApnMessage {
    match notification {
        PushNotification::Apn(message) => message,
        other => panic!("expected an APN push, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fallback_sends_wake_then_standard_push() {
    let (transport, _pubsub, notifier, scheduler) = setup(RecordingNotifier::default(), None);
    let address = DeviceAddress::new("+14152222223", 1);

    let handle = scheduler.schedule(&address, task(500)).await;
    assert!(
        transport.is_subscribed(INFO_CHANNEL),
        "pending fallback should watch the connection-info channel"
    );
    assert_eq!(handle.state(), FallbackState::ScheduledWake);

    sleep(Duration::from_millis(1100)).await;

    let sent = notifier.sent();
    assert_eq!(sent.len(), 2, "expected a wake push and a standard push");

    let wake = apn(&sent[0]);
    assert_eq!(wake.apn_id, "voipfoo");
    assert_eq!(wake.number, "123");
    assert_eq!(wake.device_id, 1);
    assert_eq!(wake.message, "hmm");
    assert!(wake.is_voip);
    assert_eq!(wake.expiration, 1111);

    let standard = apn(&sent[1]);
    assert_eq!(standard.apn_id, "foo");
    assert_eq!(standard.message, "hmm");
    assert!(!standard.is_voip);
    assert_eq!(standard.expiration, MAX_EXPIRATION);

    assert_eq!(handle.state(), FallbackState::Fired);
    assert!(!scheduler.is_pending(&address));
    assert!(!transport.is_subscribed(INFO_CHANNEL));
    assert_eq!(transport.subscribe_count(INFO_CHANNEL), 1);
    assert_eq!(transport.unsubscribe_count(INFO_CHANNEL), 1);
}

#[tokio::test]
async fn test_connected_event_cancels_fallback() {
    let (transport, pubsub, notifier, scheduler) = setup(RecordingNotifier::default(), None);
    let address = DeviceAddress::new("+14152222223", 1);

    let handle = scheduler.schedule(&address, task(500)).await;

    // The device shows up somewhere and announces itself.
    let received = pubsub
        .publish(&address.connection_info(), &PubSubEvent::Connected)
        .await
        .unwrap();
    assert!(received, "the scheduler should be listening");

    assert!(
        wait_until(Duration::from_secs(1), || async {
            handle.state() == FallbackState::Cancelled
        })
        .await,
        "CONNECTED should cancel the fallback"
    );
    assert!(
        wait_until(Duration::from_secs(1), || async {
            transport.unsubscribe_count(INFO_CHANNEL) == 1
        })
        .await
    );

    sleep(Duration::from_millis(1100)).await;
    assert!(notifier.sent().is_empty(), "no push after cancellation");
    assert!(!scheduler.is_pending(&address));
    assert_eq!(scheduler.pending_count(), 0);
}

#[tokio::test]
async fn test_connected_between_wake_and_standard_stops_standard_push() {
    let (transport, _pubsub, notifier, scheduler) =
        setup(RecordingNotifier::default(), Some(Duration::from_millis(600)));
    let address = DeviceAddress::new("+14152222223", 1);

    let handle = scheduler.schedule(&address, task(200)).await;
    assert!(
        wait_until(Duration::from_secs(1), || async {
            handle.state() == FallbackState::ScheduledStandard
        })
        .await
    );
    assert!(wait_until(Duration::from_secs(1), || async { notifier.sent().len() == 1 }).await);

    transport.inject(INFO_CHANNEL, &PubSubEvent::Connected.encode());
    assert!(
        wait_until(Duration::from_secs(1), || async {
            handle.state() == FallbackState::Cancelled
        })
        .await
    );

    sleep(Duration::from_millis(800)).await;
    assert_eq!(notifier.sent().len(), 1, "only the wake push went out");
    assert!(!transport.is_subscribed(INFO_CHANNEL));
}

#[tokio::test]
async fn test_cancel_after_fire_is_a_no_op() {
    let (_transport, _pubsub, notifier, scheduler) = setup(RecordingNotifier::default(), None);
    let address = DeviceAddress::new("+14152222223", 1);

    let handle = scheduler.schedule(&address, task(100)).await;
    assert!(
        wait_until(Duration::from_secs(2), || async {
            handle.state() == FallbackState::Fired
        })
        .await
    );

    assert!(!scheduler.cancel(&address).await);
    assert_eq!(handle.state(), FallbackState::Fired);
    assert_eq!(notifier.sent().len(), 2);
}

#[tokio::test]
async fn test_new_schedule_supersedes_pending_one() {
    let (transport, _pubsub, notifier, scheduler) = setup(RecordingNotifier::default(), None);
    let address = DeviceAddress::new("+14152222223", 1);

    let first = scheduler.schedule(&address, task(500)).await;
    let second = scheduler.schedule(&address, task(500)).await;

    assert_eq!(first.state(), FallbackState::Cancelled);
    assert_eq!(second.state(), FallbackState::ScheduledWake);
    assert_eq!(scheduler.pending_count(), 1);
    assert_eq!(
        transport.subscribe_count(INFO_CHANNEL),
        1,
        "the info channel stays subscribed across the handover"
    );

    sleep(Duration::from_millis(1100)).await;
    assert_eq!(notifier.sent().len(), 2, "only the second fallback fires");
    assert_eq!(second.state(), FallbackState::Fired);
    assert!(!transport.is_subscribed(INFO_CHANNEL));
}

#[tokio::test]
async fn test_unregistered_wake_id_still_sends_standard_push() {
    let (transport, _pubsub, notifier, scheduler) = setup(
        RecordingNotifier::failing_with(PushError::NotRegistered("voipfoo".into())),
        None,
    );
    let address = DeviceAddress::new("+14152222223", 1);

    let handle = scheduler.schedule(&address, task(300)).await;
    assert!(
        wait_until(Duration::from_secs(2), || async {
            handle.state() == FallbackState::Fired && !transport.is_subscribed(INFO_CHANNEL)
        })
        .await
    );

    let sent = notifier.sent();
    assert_eq!(sent.len(), 2, "an unregistered id is not retried");
    assert_eq!(sent[0].push_id(), "voipfoo");
    assert_eq!(sent[1].push_id(), "foo");
}

#[tokio::test]
async fn test_transport_failure_on_standard_push_is_retried() {
    let (_transport, _pubsub, notifier, scheduler) = setup(
        RecordingNotifier::failing_with(PushError::Transport("gateway down".into())),
        Some(Duration::from_millis(50)),
    );
    let address = DeviceAddress::new("+14152222223", 1);

    let handle = scheduler.schedule(&address, task(50)).await;
    assert!(
        wait_until(Duration::from_secs(3), || async {
            handle.state() == FallbackState::Fired && !scheduler.is_pending(&address)
        })
        .await
    );

    let sent = notifier.sent();
    assert_eq!(sent.len(), 4, "one wake push and three standard attempts");
    assert!(sent[1..].iter().all(|n| n.push_id() == "foo"));
}

#[tokio::test]
async fn test_fallbacks_for_different_devices_are_independent() {
    let (transport, pubsub, notifier, scheduler) = setup(RecordingNotifier::default(), None);
    let online = DeviceAddress::new("+14152222223", 1);
    let offline = DeviceAddress::new("+14152222223", 2);

    scheduler.schedule(&online, task(400)).await;
    let handle = scheduler.schedule(&offline, task(400)).await;
    assert_eq!(scheduler.pending_count(), 2);

    pubsub
        .publish(&online.connection_info(), &PubSubEvent::Connected)
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(1), || async { !scheduler.is_pending(&online) }).await);

    assert!(
        wait_until(Duration::from_secs(2), || async {
            handle.state() == FallbackState::Fired && notifier.sent().len() == 2
        })
        .await
    );
    assert!(!transport.is_subscribed("+14152222223:1:c"));
    assert!(
        wait_until(Duration::from_secs(1), || async {
            !transport.is_subscribed("+14152222223:2:c")
        })
        .await
    );
}
