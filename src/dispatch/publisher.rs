use super::connection::{Reply, ReplyReader};
use super::{CacheConnector, CacheReader, CacheWriter, DispatchError, Result};
use dispatchcore::resp::{ProtocolError, publish_command};
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// A request/reply connection used for PUBLISH.
struct CommandConnection {
    reader: ReplyReader<CacheReader>,
    writer: CacheWriter,
}

impl CommandConnection {
    async fn send(&mut self, command: &[u8]) -> Result<()> {
        self.writer.write_all(command).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Reply> {
        self.reader.read_reply().await?.ok_or(DispatchError::Closed)
    }
}

/// Fixed set of publish connections shared by every caller.
///
/// Callers are spread round-robin over the slots; each slot is used by one
/// caller at a time and is re-dialled lazily after a failure.
pub struct PublisherPool {
    connector: Arc<dyn CacheConnector>,
    slots: Vec<Mutex<Option<CommandConnection>>>,
    next: AtomicUsize,
}

impl PublisherPool {
    pub fn new(connector: Arc<dyn CacheConnector>, size: usize) -> Self {
        let slots = (0..size.max(1)).map(|_| Mutex::new(None)).collect();
        Self {
            connector,
            slots,
            next: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Publishes and returns the receiver count reported by the cache service.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut slot = self.slots[index].lock().await;
        let command = publish_command(channel, payload);

        // A pooled connection may have been closed by the server while idle.
        // A failed write is retried once on a fresh connection; once the
        // command went out it may have been applied, so it is never resent.
        let mut reused = slot.is_some();
        loop {
            if slot.is_none() {
                let (reader, writer) = self.connector.connect().await?;
                *slot = Some(CommandConnection {
                    reader: ReplyReader::new(reader),
                    writer,
                });
            }
            let Some(connection) = slot.as_mut() else {
                return Err(DispatchError::Closed);
            };

            match connection.send(&command).await {
                Ok(()) => {}
                Err(e @ (DispatchError::Io(_) | DispatchError::Closed)) if reused => {
                    warn!(target: "Dispatch/Publish", "Pooled connection failed ({e}), redialling");
                    *slot = None;
                    reused = false;
                    continue;
                }
                Err(e) => {
                    *slot = None;
                    return Err(e);
                }
            }

            match connection.receive().await {
                Ok(Reply::Integer(receivers)) => {
                    debug!(target: "Dispatch/Publish", "Published to {channel}, {receivers} receivers");
                    return Ok(receivers.max(0) as u64);
                }
                Ok(Reply::Error(message)) => return Err(DispatchError::Server(message)),
                Ok(other) => {
                    *slot = None;
                    return Err(ProtocolError::UnexpectedReply(format!(
                        "PUBLISH answered with {other:?}"
                    ))
                    .into());
                }
                Err(e) => {
                    *slot = None;
                    return Err(e);
                }
            }
        }
    }
}
