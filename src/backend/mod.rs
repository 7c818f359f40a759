// Backend-facing side of the client
// Message delivery, the offline queue, connection status and presence

use anyhow::Result;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod connection;
pub mod delivery;
pub mod outbox;
pub mod presence;
pub mod queue;
pub mod transport;

pub use connection::{ConnectionTracker, ConnectivityProbe, HttpProbe, NetworkEvent};
pub use delivery::{Delivered, DeliveryError, MultiPathSender, PathFailure};
pub use outbox::{FlushReport, Outbox, SendOutcome};
pub use presence::{PresenceChange, PresenceError, PresenceSource, PresenceTracker, RestPresenceSource};
pub use queue::MessageQueue;
pub use transport::{DeliveryPath, MessageTransport, TransportError};

use crate::config::ClientConfig;
use crate::models::{ConnectionState, ConnectionStatus};
use crate::session::SessionProvider;
use crate::storage::LocalStorage;

// Table and function names on the backend
pub mod endpoints {
    pub const MESSAGES_TABLE: &str = "messages";
    pub const PRESENCE_TABLE: &str = "user_presence";
    pub const INSERT_MESSAGE_FUNCTION: &str = "insert-message";
}

/// Delivery services for one signed-in app instance.
///
/// Created at startup and torn down with [`DeliveryService::shutdown`].
pub struct DeliveryService {
    outbox: Arc<Outbox>,
    connection: Arc<ConnectionTracker>,
    watcher: JoinHandle<()>,
}

impl DeliveryService {
    /// Wire the outbox to the connection tracker so it drains on reconnect.
    pub fn start(outbox: Outbox, connection: ConnectionTracker) -> Self {
        let outbox = Arc::new(outbox);
        let connection = Arc::new(connection);
        let watcher = outbox.clone().run_on_reconnect(connection.subscribe());
        info!("Delivery service started ({:?})", connection.status());
        Self {
            outbox,
            connection,
            watcher,
        }
    }

    /// Build every component against the real backend.
    pub fn from_config(
        config: &ClientConfig,
        storage: Arc<dyn LocalStorage>,
        session: Arc<dyn SessionProvider>,
        initially_online: bool,
    ) -> Result<Self> {
        let sender = MultiPathSender::from_config(config, session)?;
        let queue = MessageQueue::with_max_retries(storage, config.max_retries);
        let probe = Arc::new(HttpProbe::new(config)?);
        let connection = ConnectionTracker::new(probe, config.reconnect_debounce, initially_online);
        Ok(Self::start(Outbox::new(sender, queue), connection))
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn connection(&self) -> &Arc<ConnectionTracker> {
        &self.connection
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Forward a platform event. Regaining visibility while already online
    /// drains the queue directly, since no state transition will.
    pub fn handle_event(&self, event: NetworkEvent) {
        if event == NetworkEvent::VisibilityRegained && self.connection.status() == ConnectionStatus::Online {
            debug!("App visible again, draining outbox");
            let outbox = self.outbox.clone();
            tokio::spawn(async move {
                outbox.flush().await;
            });
            return;
        }
        self.connection.handle_event(event);
    }

    pub async fn shutdown(self) {
        self.watcher.abort();
        let _ = self.watcher.await;
        info!("Delivery service stopped with {} message(s) queued", self.outbox.pending_count().await);
    }
}
