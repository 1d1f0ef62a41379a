use log::{debug, error};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Executor has been shut down")]
    Shutdown,
}

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Worker pool with a bounded number of in-flight tasks.
///
/// At most `queue_size` submitted tasks exist at any time, counting both the
/// queued ones and the ones a worker is running. `submit` waits for room
/// instead of rejecting, so work is never dropped because of load.
pub struct BlockingExecutor {
    sender: Mutex<Option<mpsc::Sender<(Job, OwnedSemaphorePermit)>>>,
    permits: Arc<Semaphore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queue_size: usize,
}

impl BlockingExecutor {
    pub fn new(workers: usize, queue_size: usize) -> Self {
        let queue_size = queue_size.max(1);
        let (sender, receiver) = mpsc::channel::<(Job, OwnedSemaphorePermit)>(queue_size);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some((job, permit)) = next else {
                            debug!(target: "Dispatch/Executor", "Worker {worker_id} exiting");
                            break;
                        };
                        // A panicking task only takes down its own spawned task.
                        if let Err(e) = tokio::spawn(job).await {
                            error!(target: "Dispatch/Executor", "Task failed on worker {worker_id}: {e}");
                        }
                        drop(permit);
                    }
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            permits: Arc::new(Semaphore::new(queue_size)),
            workers: Mutex::new(handles),
            queue_size,
        }
    }

    /// Queues `task`, waiting while the executor is full.
    pub async fn submit<F>(&self, task: F) -> Result<(), ExecutorError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExecutorError::Shutdown)?;

        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(ExecutorError::Shutdown)?;

        sender
            .send((Box::pin(task), permit))
            .await
            .map_err(|_| ExecutorError::Shutdown)
    }

    /// Tasks currently queued or running.
    pub fn in_flight(&self) -> usize {
        self.queue_size - self.permits.available_permits()
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Stops accepting work, lets the workers finish what is queued and waits
    /// for them.
    pub async fn shutdown(&self) {
        self.permits.close();
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }

        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.await;
        }
        debug!(target: "Dispatch/Executor", "Executor shut down");
    }
}
