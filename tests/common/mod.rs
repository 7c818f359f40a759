// Common test utilities for integration tests
// Fake transports, sessions and presence feeds, plus a tiny HTTP stub for the reqwest-based code
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use log::LevelFilter;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use roshlingua::backend::presence::{PresenceChange, PresenceError, PresenceSource};
use roshlingua::backend::{DeliveryPath, MessageTransport, MultiPathSender, TransportError};
use roshlingua::models::{MessageRow, OutgoingMessage, PresenceRecord};
use roshlingua::session::{SessionError, SessionProvider};

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

//------------------------------------------------------------------------------
// Sessions
//------------------------------------------------------------------------------

pub struct FakeSession {
    token: Option<String>,
    pub fetches: AtomicUsize,
}

impl FakeSession {
    pub fn with_token(token: &str) -> Arc<Self> {
        Arc::new(Self { token: Some(token.to_string()), fetches: AtomicUsize::new(0) })
    }

    pub fn signed_out() -> Arc<Self> {
        Arc::new(Self { token: None, fetches: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl SessionProvider for FakeSession {
    async fn access_token(&self) -> Result<String, SessionError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.token.clone().ok_or(SessionError::Missing)
    }
}

//------------------------------------------------------------------------------
// Transports
//------------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub enum Behaviour {
    Succeed,
    Fail(TransportError),
    /// Never completes; only a timeout gets past it
    Hang,
}

/// Sets its flag when dropped, i.e. when an in-flight insert is cancelled
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct FakeTransport {
    path: DeliveryPath,
    script: Mutex<VecDeque<Behaviour>>,
    fallback: Behaviour,
    pub calls: AtomicUsize,
    pub tokens: Mutex<Vec<String>>,
    pub cancelled: Arc<AtomicBool>,
}

impl FakeTransport {
    pub fn new(path: DeliveryPath, fallback: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            path,
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Behaviours for the next calls, before falling back to the default
    pub fn scripted(path: DeliveryPath, script: Vec<Behaviour>, fallback: Behaviour) -> Arc<Self> {
        let transport = Self::new(path, fallback);
        transport.script.lock().unwrap().extend(script);
        transport
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageTransport for FakeTransport {
    fn path(&self) -> DeliveryPath {
        self.path
    }

    async fn insert(&self, message: &OutgoingMessage, access_token: &str) -> Result<MessageRow, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(access_token.to_string());
        let behaviour = self.script.lock().unwrap().pop_front().unwrap_or_else(|| self.fallback.clone());

        match behaviour {
            Behaviour::Succeed => Ok(MessageRow::from(message)),
            Behaviour::Fail(e) => Err(e),
            Behaviour::Hang => {
                let _flag = DropFlag(self.cancelled.clone());
                std::future::pending::<()>().await;
                unreachable!("pending never resolves")
            }
        }
    }
}

pub fn unauthorized() -> TransportError {
    TransportError::Unauthorized { status: 401, body: r#"{"message":"JWT expired"}"#.to_string() }
}

pub fn unavailable() -> TransportError {
    TransportError::Unavailable { status: 503, body: String::new() }
}

pub fn rejected() -> TransportError {
    TransportError::Rejected { status: 400, body: r#"{"message":"invalid input"}"#.to_string() }
}

pub struct Paths {
    pub primary: Arc<FakeTransport>,
    pub rest: Arc<FakeTransport>,
    pub function: Arc<FakeTransport>,
}

impl Paths {
    pub fn new(primary: Behaviour, rest: Behaviour, function: Behaviour) -> Self {
        Self {
            primary: FakeTransport::new(DeliveryPath::Primary, primary),
            rest: FakeTransport::new(DeliveryPath::RestFallback, rest),
            function: FakeTransport::new(DeliveryPath::Function, function),
        }
    }

    pub fn all_failing() -> Self {
        Self::new(
            Behaviour::Fail(TransportError::Network("connection refused".to_string())),
            Behaviour::Fail(TransportError::Network("connection refused".to_string())),
            Behaviour::Fail(unavailable()),
        )
    }

    pub fn sender(&self, session: Arc<dyn SessionProvider>) -> MultiPathSender {
        MultiPathSender::new(
            session,
            self.primary.clone(),
            self.rest.clone(),
            self.function.clone(),
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
    }

    pub fn total_calls(&self) -> usize {
        self.primary.call_count() + self.rest.call_count() + self.function.call_count()
    }
}

//------------------------------------------------------------------------------
// Presence
//------------------------------------------------------------------------------

/// Presence source backed by fixed rows and test-controlled change channels
pub struct FakePresenceSource {
    rows: Mutex<Vec<PresenceRecord>>,
    senders: Mutex<Vec<mpsc::Sender<PresenceChange>>>,
    pub loads: AtomicUsize,
    pub subscriptions: Mutex<Vec<Vec<String>>>,
    /// When set, `load` answers like a backend outage
    pub unavailable: AtomicBool,
}

impl FakePresenceSource {
    pub fn new(rows: Vec<PresenceRecord>) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(rows),
            senders: Mutex::new(Vec::new()),
            loads: AtomicUsize::new(0),
            subscriptions: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        })
    }

    /// Send a change through the most recent subscription
    pub async fn emit(&self, change: PresenceChange) {
        let tx = self.senders.lock().unwrap().last().cloned().expect("no active subscription");
        tx.send(change).await.expect("subscription closed");
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }
}

#[async_trait]
impl PresenceSource for FakePresenceSource {
    async fn load(&self, user_ids: &[String]) -> Result<Vec<PresenceRecord>, PresenceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PresenceError::Status { status: 503, body: String::new() });
        }
        let rows = self.rows.lock().unwrap();
        Ok(rows.iter().filter(|r| user_ids.contains(&r.user_id)).cloned().collect())
    }

    async fn subscribe(
        &self,
        user_ids: &[String],
        _baseline: &[PresenceRecord],
    ) -> Result<mpsc::Receiver<PresenceChange>, PresenceError> {
        let (tx, rx) = mpsc::channel(16);
        self.senders.lock().unwrap().push(tx);
        self.subscriptions.lock().unwrap().push(user_ids.to_vec());
        Ok(rx)
    }
}

/// Poll `condition` while letting spawned tasks run
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

//------------------------------------------------------------------------------
// HTTP stub
//------------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Answers every request with the same status and body and records what it saw
pub struct StubServer {
    pub base_url: String,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl StubServer {
    pub async fn start(status: u16, body: &str) -> StubServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub server");
        let addr = listener.local_addr().expect("stub address");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();
        let body = body.to_string();

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let recorded = recorded.clone();
                let body = body.clone();
                tokio::spawn(async move {
                    if let Some(request) = read_request(&mut socket).await {
                        recorded.lock().unwrap().push(request);
                    }
                    let response = format!(
                        "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        StubServer { base_url: format!("http://{}", addr), requests }
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<RecordedRequest> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();

    let headers: Vec<(String, String)> = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    let content_length = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);

    while buffer.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }

    let body_end = (header_end + content_length).min(buffer.len());
    let body = String::from_utf8_lossy(&buffer[header_end..body_end]).to_string();
    Some(RecordedRequest { method, target, headers, body })
}
