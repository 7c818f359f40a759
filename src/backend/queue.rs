// Local queue of outgoing messages the backend has not confirmed yet
// The whole queue is written to device storage after every mutation

use log::{debug, error, info, warn};
use std::sync::Arc;

use crate::models::{OutgoingMessage, QueuedMessage};
use crate::storage::LocalStorage;

/// Storage key holding the JSON array of queued messages.
pub const QUEUE_STORAGE_KEY: &str = "pending_messages";

/// Number of failed retries after which a message is abandoned.
pub const MAX_RETRIES: u32 = 3;

pub struct MessageQueue {
    storage: Arc<dyn LocalStorage>,
    messages: Vec<QueuedMessage>,
    max_retries: u32,
}

impl MessageQueue {
    /// Load the queue from storage.
    ///
    /// A missing or unreadable entry yields an empty queue; the error is logged.
    pub fn open(storage: Arc<dyn LocalStorage>) -> Self {
        Self::with_max_retries(storage, MAX_RETRIES)
    }

    pub fn with_max_retries(storage: Arc<dyn LocalStorage>, max_retries: u32) -> Self {
        let messages = match storage.get_item(QUEUE_STORAGE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<QueuedMessage>>(&raw) {
                Ok(messages) => messages,
                Err(e) => {
                    error!("Discarding unreadable message queue: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                error!("Failed to load message queue: {}", e);
                Vec::new()
            }
        };

        if !messages.is_empty() {
            info!("Loaded {} queued message(s) from local storage", messages.len());
        }

        Self {
            storage,
            messages,
            max_retries,
        }
    }

    /// Queue a message with a zero retry count.
    ///
    /// A message whose id is already queued keeps its existing entry.
    pub fn add(&mut self, message: OutgoingMessage) {
        if self.messages.iter().any(|m| m.message.id == message.id) {
            debug!("Message {} is already queued", message.id);
            return;
        }
        info!("Queueing message {} for later delivery", message.id);
        self.messages.push(QueuedMessage::new(message));
        self.persist();
    }

    /// Remove a message by id; returns whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.message.id != id);
        let removed = self.messages.len() != before;
        if removed {
            debug!("Removed message {} from queue", id);
            self.persist();
        }
        removed
    }

    /// Bump the retry counter of a queued message and return the new count.
    pub fn increment_retry(&mut self, id: &str) -> Option<u32> {
        let retries = match self.messages.iter_mut().find(|m| m.message.id == id) {
            Some(entry) => {
                entry.retries += 1;
                entry.retries
            }
            None => {
                warn!("Cannot increment retry count of unknown message {}", id);
                return None;
            }
        };
        self.persist();
        Some(retries)
    }

    pub fn should_retry(&self, message: &QueuedMessage) -> bool {
        message.retries < self.max_retries
    }

    /// Owned copy of the queue in insertion order.
    pub fn get_all(&self) -> Vec<QueuedMessage> {
        self.messages.clone()
    }

    pub fn get(&self, id: &str) -> Option<QueuedMessage> {
        self.messages.iter().find(|m| m.message.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.persist();
    }

    // Persistence failures never reach the caller; memory stays authoritative
    fn persist(&self) {
        let raw = match serde_json::to_string(&self.messages) {
            Ok(raw) => raw,
            Err(e) => {
                error!("Failed to serialize message queue: {}", e);
                return;
            }
        };
        if let Err(e) = self.storage.set_item(QUEUE_STORAGE_KEY, &raw) {
            error!("Failed to persist message queue ({} entries): {}", self.messages.len(), e);
        }
    }
}
