// Connection status tracking
// Debounces reconnects so the user sees "reconnecting" for a whole window instead of flicker

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::models::{ConnectionState, ConnectionStatus};

/// Signals from the platform about connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Up,
    Down,
    VisibilityRegained,
    ReconnectRequested,
}

/// Checks whether the backend can actually be reached.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Probe that treats any HTTP answer from the REST root as reachable.
pub struct HttpProbe {
    http: Client,
    url: String,
    anon_key: String,
}

impl HttpProbe {
    pub fn new(config: &ClientConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: Client::builder().timeout(config.reconnect_debounce).build()?,
            url: format!("{}/rest/v1/", config.backend_url),
            anon_key: config.anon_key.clone(),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check(&self) -> bool {
        match self.http.head(&self.url).header("apikey", &self.anon_key).send().await {
            Ok(response) => {
                debug!("Connectivity probe answered with HTTP {}", response.status());
                true
            }
            Err(e) => {
                debug!("Connectivity probe failed: {}", e);
                false
            }
        }
    }
}

pub struct ConnectionTracker {
    state_tx: watch::Sender<ConnectionState>,
    probe: Arc<dyn ConnectivityProbe>,
    debounce: Duration,
    // Bumped on every network-down so a stale reconnect cannot report online
    generation: AtomicU64,
    reconnecting: TokioMutex<()>,
}

impl ConnectionTracker {
    pub fn new(probe: Arc<dyn ConnectivityProbe>, debounce: Duration, initially_online: bool) -> Self {
        let initial = if initially_online {
            ConnectionState::ONLINE
        } else {
            ConnectionState::OFFLINE
        };
        let (state_tx, _) = watch::channel(initial);
        Self {
            state_tx,
            probe,
            debounce,
            generation: AtomicU64::new(0),
            reconnecting: TokioMutex::new(()),
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.current().status()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Apply a platform event. Reconnects run in a spawned task.
    pub fn handle_event(self: &Arc<Self>, event: NetworkEvent) -> Option<JoinHandle<()>> {
        match event {
            NetworkEvent::Down => {
                self.generation.fetch_add(1, Ordering::SeqCst);
                if self.set_state(ConnectionState::OFFLINE) {
                    warn!("Network went down");
                }
                None
            }
            NetworkEvent::Up | NetworkEvent::VisibilityRegained | NetworkEvent::ReconnectRequested => {
                if self.status() != ConnectionStatus::Offline {
                    debug!("Ignoring {:?} while {:?}", event, self.status());
                    return None;
                }
                let tracker = Arc::clone(self);
                Some(tokio::spawn(async move {
                    tracker.reconnect().await;
                }))
            }
        }
    }

    /// Run one debounced reconnect attempt.
    ///
    /// The state reads "reconnecting" for the full debounce window; the probe
    /// result is applied once the window has passed. Returns the final state.
    ///
    /// Attempts are serialised. One started while a superseded attempt still
    /// holds its window waits for it, then runs if the tracker is still offline.
    pub async fn reconnect(&self) -> ConnectionState {
        let _guard = self.reconnecting.lock().await;
        if self.status() != ConnectionStatus::Offline {
            debug!("No reconnect needed while {:?}", self.status());
            return self.current();
        }

        let generation = self.generation.load(Ordering::SeqCst);
        self.set_state(ConnectionState::RECONNECTING);
        info!("Reconnecting...");

        let probe = async {
            match tokio::time::timeout(self.debounce, self.probe.check()).await {
                Ok(reachable) => reachable,
                Err(_) => false,
            }
        };
        let (reachable, _) = tokio::join!(probe, tokio::time::sleep(self.debounce));

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Network went down during reconnect; discarding probe result");
            return self.current();
        }

        let next = if reachable {
            info!("Connection restored");
            ConnectionState::ONLINE
        } else {
            warn!("Reconnect failed; still offline");
            ConnectionState::OFFLINE
        };
        self.set_state(next);
        next
    }

    fn set_state(&self, next: ConnectionState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        })
    }
}
