// Outbox: delivery with a persisted retry queue behind it

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use crate::models::{ConnectionState, OutgoingMessage, QueuedMessage};

use super::delivery::{Delivered, DeliveryError, MultiPathSender};
use super::queue::MessageQueue;

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered(Delivered),
    /// Every path failed transiently; the message waits in the queue
    Queued { message_id: String },
}

/// Result of one pass over the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub retrying: usize,
    pub dropped: usize,
    /// Another flush was already running
    pub skipped: bool,
}

pub struct Outbox {
    sender: MultiPathSender,
    queue: TokioMutex<MessageQueue>,
    flushing: TokioMutex<()>,
}

impl Outbox {
    pub fn new(sender: MultiPathSender, queue: MessageQueue) -> Self {
        Self {
            sender,
            queue: TokioMutex::new(queue),
            flushing: TokioMutex::new(()),
        }
    }

    /// Send a message now, queueing it if every path fails transiently.
    ///
    /// Missing sessions and rejected payloads are returned to the caller and
    /// never queued.
    pub async fn send(&self, message: OutgoingMessage) -> Result<SendOutcome, DeliveryError> {
        match self.sender.deliver(&message).await {
            Ok(delivered) => Ok(SendOutcome::Delivered(delivered)),
            Err(e) if e.is_retryable() => {
                let message_id = message.id.clone();
                self.queue.lock().await.add(message);
                Ok(SendOutcome::Queued { message_id })
            }
            Err(e) => {
                error!("Message {} will not be queued: {}", message.id, e);
                Err(e)
            }
        }
    }

    /// Retry every queued message once.
    pub async fn flush(&self) -> FlushReport {
        let _flushing = match self.flushing.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Flush already running");
                return FlushReport { skipped: true, ..Default::default() };
            }
        };

        let pending = self.queue.lock().await.get_all();
        if pending.is_empty() {
            return FlushReport::default();
        }
        info!("Flushing {} queued message(s)", pending.len());

        let mut report = FlushReport::default();
        for queued in pending {
            let id = queued.id().to_string();
            {
                let mut queue = self.queue.lock().await;
                if !queue.should_retry(&queued) {
                    warn!("Dropping message {} after {} retries", id, queued.retries);
                    queue.remove(&id);
                    report.dropped += 1;
                    continue;
                }
            }

            // The queue lock is not held across the network calls
            let result = self.sender.deliver(&queued.message).await;

            let mut queue = self.queue.lock().await;
            match result {
                Ok(_) => {
                    queue.remove(&id);
                    report.delivered += 1;
                }
                Err(DeliveryError::Unauthenticated(e)) => {
                    warn!("Stopping flush, no session: {}", e);
                    report.retrying = queue.len();
                    break;
                }
                Err(e) if !e.is_retryable() => {
                    error!("Dropping message {}: {}", id, e);
                    queue.remove(&id);
                    report.dropped += 1;
                }
                Err(e) => {
                    let retries = queue.increment_retry(&id);
                    let exhausted = queue.get(&id).map(|m| !queue.should_retry(&m)).unwrap_or(false);
                    if exhausted {
                        error!("Abandoning message {} after {} failed retries: {}",
                            id, retries.unwrap_or_default(), e);
                        queue.remove(&id);
                        report.dropped += 1;
                    } else {
                        report.retrying += 1;
                    }
                }
            }
        }

        info!(
            "Flush finished: {} delivered, {} still queued, {} dropped",
            report.delivered, report.retrying, report.dropped
        );
        report
    }

    pub async fn pending(&self) -> Vec<QueuedMessage> {
        self.queue.lock().await.get_all()
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn clear(&self) {
        self.queue.lock().await.clear();
    }

    /// Flush whenever the watched connection state becomes online.
    ///
    /// The task ends when the sending side of `state_rx` is dropped.
    pub fn run_on_reconnect(self: Arc<Self>, mut state_rx: watch::Receiver<ConnectionState>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut was_online = state_rx.borrow_and_update().online;
            while state_rx.changed().await.is_ok() {
                let online = state_rx.borrow_and_update().online;
                if online && !was_online {
                    debug!("Connection restored, draining outbox");
                    self.flush().await;
                }
                was_online = online;
            }
            debug!("Connection state channel closed; outbox watcher stopping");
        })
    }
}
