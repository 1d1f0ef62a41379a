use super::{MessagePage, MessageStore, Result, StoreError, StoredMessage};
use async_trait::async_trait;
use dispatchcore::DeviceAddress;
use dispatchcore::proto::envelope::Envelope;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

pub const PAGE_SIZE: usize = 100;
const DEFAULT_CAPACITY_PER_DEVICE: usize = 10_000;

/// Message store kept in process memory; used by tests and by the binary when
/// no external store is configured.
#[derive(Clone)]
pub struct InMemoryMessageStore {
    queues: Arc<RwLock<HashMap<DeviceAddress, VecDeque<StoredMessage>>>>,
    next_id: Arc<AtomicU64>,
    capacity_per_device: usize,
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY_PER_DEVICE)
    }

    pub fn with_capacity(capacity_per_device: usize) -> Self {
        Self {
            queues: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity_per_device,
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn store(&self, envelope: &Envelope, recipient: &DeviceAddress) -> Result<u64> {
        let mut queues = self.queues.write().await;
        let queue = queues.entry(recipient.clone()).or_default();
        if queue.len() >= self.capacity_per_device {
            return Err(StoreError::Full(recipient.to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        queue.push_back(StoredMessage {
            id,
            envelope: envelope.clone(),
        });
        Ok(id)
    }

    async fn load_page(&self, recipient: &DeviceAddress) -> Result<MessagePage> {
        let queues = self.queues.read().await;
        let Some(queue) = queues.get(recipient) else {
            return Ok(MessagePage::default());
        };

        Ok(MessagePage {
            messages: queue.iter().take(PAGE_SIZE).cloned().collect(),
            has_more: queue.len() > PAGE_SIZE,
        })
    }

    async fn remove(
        &self,
        recipient: &DeviceAddress,
        sender: &str,
        timestamp: u64,
    ) -> Result<Option<StoredMessage>> {
        let mut queues = self.queues.write().await;
        let Some(queue) = queues.get_mut(recipient) else {
            return Ok(None);
        };

        let removed = queue
            .iter()
            .position(|m| m.sender() == sender && m.timestamp() == timestamp)
            .and_then(|index| queue.remove(index));

        if queue.is_empty() {
            queues.remove(recipient);
        }
        Ok(removed)
    }

    async fn count(&self, recipient: &DeviceAddress) -> Result<usize> {
        let queues = self.queues.read().await;
        Ok(queues.get(recipient).map_or(0, VecDeque::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(source: &str, timestamp: u64) -> Envelope {
        Envelope {
            source: Some(source.to_string()),
            timestamp: Some(timestamp),
            content: Some(vec![1, 2, 3]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_store_and_remove() {
        let store = InMemoryMessageStore::new();
        let recipient = DeviceAddress::new("+14151111111", 1);

        let first = store.store(&envelope("+14152222222", 10), &recipient).await.unwrap();
        let second = store.store(&envelope("+14152222222", 11), &recipient).await.unwrap();
        assert!(second > first);
        assert_eq!(store.count(&recipient).await.unwrap(), 2);

        let removed = store.remove(&recipient, "+14152222222", 10).await.unwrap();
        assert_eq!(removed.map(|m| m.id), Some(first));
        assert!(store.remove(&recipient, "+14152222222", 10).await.unwrap().is_none());
        assert_eq!(store.count(&recipient).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pages_are_oldest_first() {
        let store = InMemoryMessageStore::new();
        let recipient = DeviceAddress::new("+14151111111", 1);
        for timestamp in 0..(PAGE_SIZE as u64 + 5) {
            store.store(&envelope("+14152222222", timestamp), &recipient).await.unwrap();
        }

        let page = store.load_page(&recipient).await.unwrap();
        assert_eq!(page.messages.len(), PAGE_SIZE);
        assert!(page.has_more);
        assert_eq!(page.messages[0].timestamp(), 0);

        let other = DeviceAddress::new("+14151111111", 2);
        assert_eq!(store.load_page(&other).await.unwrap(), MessagePage::default());
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let store = InMemoryMessageStore::with_capacity(1);
        let recipient = DeviceAddress::new("+14151111111", 1);
        store.store(&envelope("a", 1), &recipient).await.unwrap();
        assert!(matches!(
            store.store(&envelope("a", 2), &recipient).await,
            Err(StoreError::Full(_))
        ));
    }
}
