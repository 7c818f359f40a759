// Multi-path message delivery
// Tries the primary backend client, then the raw REST endpoint, then the insert-message function

use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::ClientConfig;
use crate::models::{MessageRow, OutgoingMessage};
use crate::session::{SessionError, SessionProvider};

use super::transport::{
    BackendClient, DeliveryPath, FunctionTransport, MessageTransport, RestTransport, TransportError,
};

/// Successful commit of a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub row: MessageRow,
    pub path: DeliveryPath,
    /// The backend already held a row with this client_id
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathFailure {
    pub path: DeliveryPath,
    pub error: TransportError,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Cannot send without a session: {0}")]
    Unauthenticated(#[source] SessionError),

    #[error("All {} delivery paths failed for message {message_id}", .failures.len())]
    Exhausted {
        message_id: String,
        failures: Vec<PathFailure>,
    },
}

impl DeliveryError {
    /// Whether queueing the message for a later attempt makes sense.
    ///
    /// A payload refused by the backend on any path will be refused again.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Unauthenticated(_) => false,
            DeliveryError::Exhausted { failures, .. } => failures.iter().all(|f| f.error.is_retryable()),
        }
    }

    pub fn failures(&self) -> &[PathFailure] {
        match self {
            DeliveryError::Unauthenticated(_) => &[],
            DeliveryError::Exhausted { failures, .. } => failures,
        }
    }
}

struct Route {
    transport: Arc<dyn MessageTransport>,
    timeout: Option<Duration>,
}

pub struct MultiPathSender {
    session: Arc<dyn SessionProvider>,
    routes: Vec<Route>,
}

impl MultiPathSender {
    /// Assemble a sender from its three transports, tried in this order.
    pub fn new(
        session: Arc<dyn SessionProvider>,
        primary: Arc<dyn MessageTransport>,
        rest: Arc<dyn MessageTransport>,
        function: Arc<dyn MessageTransport>,
        primary_timeout: Duration,
        function_timeout: Duration,
    ) -> Self {
        let routes = vec![
            Route { transport: primary, timeout: Some(primary_timeout) },
            Route { transport: rest, timeout: None },
            Route { transport: function, timeout: Some(function_timeout) },
        ];
        Self { session, routes }
    }

    /// Sender wired to the real backend endpoints.
    pub fn from_config(config: &ClientConfig, session: Arc<dyn SessionProvider>) -> Result<Self, TransportError> {
        Ok(Self::new(
            session,
            Arc::new(BackendClient::new(config)?),
            Arc::new(RestTransport::new(config)?),
            Arc::new(FunctionTransport::new(config)?),
            config.primary_timeout,
            config.function_timeout,
        ))
    }

    /// Deliver a message through the first path that succeeds.
    ///
    /// Paths are attempted one after the other; nothing is retried here.
    pub async fn deliver(&self, message: &OutgoingMessage) -> Result<Delivered, DeliveryError> {
        let token = match self.session.access_token().await {
            Ok(token) => token,
            Err(e) => {
                error!("Not sending message {}: {}", message.id, e);
                return Err(DeliveryError::Unauthenticated(e));
            }
        };

        let mut failures = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            let path = route.transport.path();
            match Self::attempt(route, message, &token).await {
                Ok(row) => {
                    info!("Message {} delivered via {} path", message.id, path);
                    return Ok(Delivered { row, path, duplicate: false });
                }
                Err(TransportError::Duplicate) => {
                    info!("Message {} (client_id {}) was already delivered; {} path reported a duplicate",
                        message.id, message.client_id, path);
                    return Ok(Delivered {
                        row: MessageRow::from(message),
                        path,
                        duplicate: true,
                    });
                }
                Err(e) => {
                    warn!("Message {} failed on {} path: {}", message.id, path, e);
                    failures.push(PathFailure { path, error: e });
                }
            }
        }

        error!("Message {} failed on every delivery path", message.id);
        Err(DeliveryError::Exhausted {
            message_id: message.id.clone(),
            failures,
        })
    }

    // Dropping the insert future on timeout cancels the underlying request
    async fn attempt(route: &Route, message: &OutgoingMessage, token: &str) -> Result<MessageRow, TransportError> {
        let insert = route.transport.insert(message, token);
        match route.timeout {
            Some(limit) => match tokio::time::timeout(limit, insert).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(limit)),
            },
            None => insert.await,
        }
    }
}
