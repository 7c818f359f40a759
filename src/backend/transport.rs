// Transports able to commit a message row to the backend
// Each one is a single attempt; ordering and fallback live in delivery.rs

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::ClientConfig;
use crate::models::{MessageRow, OutgoingMessage};

use super::endpoints;

/// Which delivery path produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryPath {
    Primary,
    RestFallback,
    Function,
}

impl fmt::Display for DeliveryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryPath::Primary => "primary",
            DeliveryPath::RestFallback => "rest-fallback",
            DeliveryPath::Function => "function",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not authorized (HTTP {status}): {body}")]
    Unauthorized { status: u16, body: String },

    #[error("Backend unavailable (HTTP {status}): {body}")]
    Unavailable { status: u16, body: String },

    #[error("Message rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    /// A row with the same client_id already exists
    #[error("Message already delivered")]
    Duplicate,

    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether sending the same payload again could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected { .. })
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: StatusCode, body: String) -> Self {
        let code = status.as_u16();
        match status {
            StatusCode::CONFLICT => TransportError::Duplicate,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                TransportError::Unauthorized { status: code, body }
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                TransportError::Unavailable { status: code, body }
            }
            s if s.is_server_error() => TransportError::Unavailable { status: code, body },
            _ => TransportError::Rejected { status: code, body },
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

/// One way of inserting a message.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    fn path(&self) -> DeliveryPath;

    /// Insert `message`, authenticating with the caller's `access_token`
    /// where the path needs one.
    async fn insert(&self, message: &OutgoingMessage, access_token: &str) -> Result<MessageRow, TransportError>;
}

fn build_client(timeout: Option<Duration>) -> Result<Client, TransportError> {
    let mut builder = Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().map_err(|e| TransportError::Network(format!("Failed to create HTTP client: {}", e)))
}

async fn error_for_response(response: Response) -> TransportError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    TransportError::from_status(status, body)
}

async fn send_request(request: RequestBuilder, timeout: Option<Duration>) -> Result<Response, TransportError> {
    let result = request.send().await;
    match result {
        Ok(response) => Ok(response),
        Err(e) if e.is_timeout() => Err(TransportError::Timeout(timeout.unwrap_or_default())),
        Err(e) => Err(e.into()),
    }
}

/// Reads the `return=representation` body, which is an array of inserted rows.
async fn first_row(response: Response) -> Result<Option<MessageRow>, TransportError> {
    let rows: Vec<MessageRow> = response.json().await?;
    Ok(rows.into_iter().next())
}

/// The long-lived backend client. Its insert is an upsert keyed on
/// `client_id`, so a repeat of an already committed message yields no row.
pub struct BackendClient {
    http: Client,
    messages_url: String,
    anon_key: String,
}

impl BackendClient {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        Ok(Self {
            http: build_client(None)?,
            messages_url: config.rest_url(endpoints::MESSAGES_TABLE),
            anon_key: config.anon_key.clone(),
        })
    }
}

#[async_trait]
impl MessageTransport for BackendClient {
    fn path(&self) -> DeliveryPath {
        DeliveryPath::Primary
    }

    async fn insert(&self, message: &OutgoingMessage, access_token: &str) -> Result<MessageRow, TransportError> {
        debug!("Inserting message {} through backend client", message.id);
        let request = self
            .http
            .post(&self.messages_url)
            .query(&[("on_conflict", "client_id")])
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .header("Prefer", "return=representation,resolution=ignore-duplicates")
            .json(message);

        let response = send_request(request, None).await?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        // Ignored duplicates come back as an empty array
        first_row(response).await?.ok_or(TransportError::Duplicate)
    }
}

/// Hand-built authenticated POST against the REST endpoint.
pub struct RestTransport {
    http: Client,
    messages_url: String,
    anon_key: String,
    timeout: Duration,
}

impl RestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let timeout = config.function_timeout;
        Ok(Self {
            http: build_client(Some(timeout))?,
            messages_url: config.rest_url(endpoints::MESSAGES_TABLE),
            anon_key: config.anon_key.clone(),
            timeout,
        })
    }
}

#[async_trait]
impl MessageTransport for RestTransport {
    fn path(&self) -> DeliveryPath {
        DeliveryPath::RestFallback
    }

    async fn insert(&self, message: &OutgoingMessage, access_token: &str) -> Result<MessageRow, TransportError> {
        debug!("POST {} for message {}", self.messages_url, message.id);
        let request = self
            .http
            .post(&self.messages_url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", access_token))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .json(message);

        let response = send_request(request, Some(self.timeout)).await?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        first_row(response)
            .await?
            .ok_or_else(|| TransportError::Decode("empty representation".to_string()))
    }
}

/// Server-side `insert-message` function; authenticates with the anon key.
pub struct FunctionTransport {
    http: Client,
    function_url: String,
    anon_key: String,
    timeout: Duration,
}

impl FunctionTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let timeout = config.function_timeout;
        Ok(Self {
            http: build_client(Some(timeout))?,
            function_url: config.function_url(endpoints::INSERT_MESSAGE_FUNCTION),
            anon_key: config.anon_key.clone(),
            timeout,
        })
    }
}

#[async_trait]
impl MessageTransport for FunctionTransport {
    fn path(&self) -> DeliveryPath {
        DeliveryPath::Function
    }

    async fn insert(&self, message: &OutgoingMessage, _access_token: &str) -> Result<MessageRow, TransportError> {
        debug!("Invoking {} for message {}", self.function_url, message.id);
        let request = self
            .http
            .post(&self.function_url)
            .bearer_auth(&self.anon_key)
            .json(message);

        let response = send_request(request, Some(self.timeout)).await?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        Ok(response.json::<MessageRow>().await?)
    }
}
