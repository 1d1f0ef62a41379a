use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use whisper_dispatch::proto::envelope::Envelope;
use whisper_dispatch::storage::{InMemoryMessageStore, MessageStore};
use whisper_dispatch::test_utils::{LoopbackTransport, RecordingChannel, wait_until};
use whisper_dispatch::websocket::DeadLetterHandler;
use whisper_dispatch::{BlockingExecutor, DeviceAddress, PubSubEvent, PubSubManager};

struct Fixture {
    transport: Arc<LoopbackTransport>,
    pubsub: Arc<PubSubManager>,
    store: Arc<InMemoryMessageStore>,
}

fn fixture() -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();

    let transport = Arc::new(LoopbackTransport::new());
    let store = Arc::new(InMemoryMessageStore::new());
    let executor = Arc::new(BlockingExecutor::new(2, 16));
    let dead_letter = Arc::new(DeadLetterHandler::new(executor, store.clone()));
    let pubsub = Arc::new(PubSubManager::new(transport.clone(), Some(dead_letter)));
    pubsub.start();
    Fixture {
        transport,
        pubsub,
        store,
    }
}

fn envelope(source: &str, timestamp: u64) -> Envelope {
    Envelope {
        r#type: Some(1),
        source: Some(source.to_string()),
        source_device: Some(1),
        timestamp: Some(timestamp),
        content: Some(b"ciphertext".to_vec()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_publish_reaches_local_subscriber_in_order() {
    let f = fixture();
    let address = DeviceAddress::new("+14151111111", 1);
    let handler = Arc::new(RecordingChannel::default());
    f.pubsub.subscribe(&address, handler.clone()).await.unwrap();

    for timestamp in 1..=20 {
        let event = PubSubEvent::deliver(&envelope("+14152222222", timestamp));
        assert!(f.pubsub.publish(&address, &event).await.unwrap());
    }

    assert!(wait_until(Duration::from_secs(1), || async { handler.messages().len() == 20 }).await);
    let timestamps: Vec<u64> = handler
        .messages()
        .iter()
        .map(|(channel, data)| {
            assert_eq!(channel, "+14151111111:1");
            match PubSubEvent::decode(data).unwrap() {
                PubSubEvent::Deliver(content) => Envelope::decode(content).unwrap().timestamp(),
                other => panic!("unexpected event {other:?}"),
            }
        })
        .collect();
    assert_eq!(timestamps, (1..=20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_publish_without_subscriber_reports_no_receivers() {
    let f = fixture();
    let address = DeviceAddress::new("+14151111111", 1);

    let received = f
        .pubsub
        .publish(&address, &PubSubEvent::KeepAlive)
        .await
        .unwrap();
    assert!(!received);

    f.transport.add_remote_subscriber("+14151111111:1");
    let received = f
        .pubsub
        .publish(&address, &PubSubEvent::KeepAlive)
        .await
        .unwrap();
    assert!(received, "a subscriber in another process counts");
}

#[tokio::test]
async fn test_unowned_device_delivery_goes_to_dead_letter_store() {
    let f = fixture();
    let address = DeviceAddress::new("+14153333333", 2);

    let event = PubSubEvent::deliver(&envelope("+14152222222", 7));
    f.transport.inject("+14153333333:2", &event.encode());

    let store = f.store.clone();
    let lookup = address.clone();
    assert!(
        wait_until(Duration::from_secs(1), || {
            let store = store.clone();
            let lookup = lookup.clone();
            async move { store.count(&lookup).await.unwrap() == 1 }
        })
        .await,
        "dead letter should be stored for the device"
    );

    let page = f.store.load_page(&address).await.unwrap();
    assert_eq!(page.messages[0].sender(), "+14152222222");
    assert_eq!(page.messages[0].timestamp(), 7);
}

#[tokio::test]
async fn test_connection_info_and_keepalive_are_never_stored() {
    let f = fixture();
    let address = DeviceAddress::new("+14153333333", 2);
    let event = PubSubEvent::deliver(&envelope("+14152222222", 7));

    f.transport.inject("+14153333333:2:c", &event.encode());
    f.transport
        .inject("+14153333333:2", &PubSubEvent::KeepAlive.encode());
    f.transport
        .inject("+14153333333:2", &PubSubEvent::Connected.encode());

    // A marker published after the others proves they were all routed.
    let marker = DeviceAddress::new("+14159999999", 1);
    f.transport.inject(
        "+14159999999:1",
        &PubSubEvent::deliver(&envelope("+14152222222", 8)).encode(),
    );
    let store = f.store.clone();
    assert!(
        wait_until(Duration::from_secs(1), || {
            let store = store.clone();
            let marker = marker.clone();
            async move { store.count(&marker).await.unwrap() == 1 }
        })
        .await
    );

    assert_eq!(f.store.count(&address).await.unwrap(), 0);
}

#[tokio::test]
async fn test_owned_channel_does_not_dead_letter() {
    let f = fixture();
    let address = DeviceAddress::new("+14153333333", 2);
    let handler = Arc::new(RecordingChannel::default());
    f.pubsub.subscribe(&address, handler.clone()).await.unwrap();

    let event = PubSubEvent::deliver(&envelope("+14152222222", 7));
    f.transport.inject("+14153333333:2", &event.encode());

    assert!(wait_until(Duration::from_secs(1), || async { handler.messages().len() == 1 }).await);
    assert_eq!(f.store.count(&address).await.unwrap(), 0);

    // Once released, the same publish is dead-lettered.
    assert!(f.pubsub.unsubscribe(&address, handler.as_ref()).await);
    f.transport.inject("+14153333333:2", &event.encode());

    let store = f.store.clone();
    let lookup = address.clone();
    assert!(
        wait_until(Duration::from_secs(1), || {
            let store = store.clone();
            let lookup = lookup.clone();
            async move { store.count(&lookup).await.unwrap() == 1 }
        })
        .await
    );
    assert_eq!(handler.messages().len(), 1);
}

#[tokio::test]
async fn test_subscription_conflict_keeps_first_owner() {
    let f = fixture();
    let address = DeviceAddress::new("+14151111111", 1);
    let first = Arc::new(RecordingChannel::default());
    let second = Arc::new(RecordingChannel::default());

    f.pubsub.subscribe(&address, first.clone()).await.unwrap();
    assert!(f.pubsub.subscribe(&address, second.clone()).await.is_err());
    assert!(!f.pubsub.unsubscribe(&address, second.as_ref()).await);

    f.pubsub
        .publish(&address, &PubSubEvent::KeepAlive)
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(1), || async { first.messages().len() == 1 }).await);
    assert!(second.messages().is_empty());
    assert_eq!(f.pubsub.subscription_count(), 1);
}
