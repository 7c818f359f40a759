// Batch presence tracking
// Keeps a map of presence rows for a set of users in sync with the backend's user_presence table

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use reqwest::Client;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::models::{PresenceRecord, PresenceStatus};
use crate::session::{SessionError, SessionProvider};

use super::endpoints;

/// How long an "online" row counts as current without an update.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Presence query failed (HTTP {status}): {body}")]
    Status { status: u16, body: String },

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// A change notification for one presence row.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    Upsert(PresenceRecord),
    Delete { user_id: String },
}

impl PresenceChange {
    pub fn user_id(&self) -> &str {
        match self {
            PresenceChange::Upsert(record) => &record.user_id,
            PresenceChange::Delete { user_id } => user_id,
        }
    }
}

#[async_trait]
pub trait PresenceSource: Send + Sync {
    /// Current rows for the given users.
    async fn load(&self, user_ids: &[String]) -> Result<Vec<PresenceRecord>, PresenceError>;

    /// Change notifications restricted to the given users, relative to
    /// `baseline` (the rows the caller just loaded). The stream ends when the
    /// receiver is dropped.
    async fn subscribe(
        &self,
        user_ids: &[String],
        baseline: &[PresenceRecord],
    ) -> Result<mpsc::Receiver<PresenceChange>, PresenceError>;
}

/// Online means status "online" and an update within `stale_after`.
pub fn is_online(record: &PresenceRecord, now: DateTime<Utc>, stale_after: Duration) -> bool {
    if record.status != PresenceStatus::Online {
        return false;
    }
    match (now - record.updated_at).to_std() {
        Ok(age) => age < stale_after,
        // updated_at in the future: clock skew, treat as fresh
        Err(_) => true,
    }
}

pub struct PresenceTracker {
    source: Arc<dyn PresenceSource>,
    stale_after: Duration,
    records: Arc<RwLock<HashMap<String, PresenceRecord>>>,
    tracked: Option<BTreeSet<String>>,
    subscription: Option<JoinHandle<()>>,
}

impl PresenceTracker {
    pub fn new(source: Arc<dyn PresenceSource>, stale_after: Duration) -> Self {
        Self {
            source,
            stale_after,
            records: Arc::new(RwLock::new(HashMap::new())),
            tracked: None,
            subscription: None,
        }
    }

    /// Track presence for `user_ids`.
    ///
    /// Only a change in membership reloads and resubscribes; order and
    /// duplicates are irrelevant. Returns whether a new subscription was made.
    /// On error the previous set stays tracked.
    pub async fn track<I, S>(&mut self, user_ids: I) -> Result<bool, PresenceError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wanted: BTreeSet<String> = user_ids.into_iter().map(Into::into).collect();
        if self.tracked.as_ref() == Some(&wanted) {
            debug!("Presence set unchanged ({} users)", wanted.len());
            return Ok(false);
        }

        let ids: Vec<String> = wanted.iter().cloned().collect();
        let rows: Vec<PresenceRecord> = self
            .source
            .load(&ids)
            .await?
            .into_iter()
            .filter(|r| wanted.contains(&r.user_id))
            .collect();
        let changes = self.source.subscribe(&ids, &rows).await?;

        self.stop();
        {
            let mut records = self.write_records();
            records.clear();
            for row in rows {
                records.insert(row.user_id.clone(), row);
            }
        }
        self.subscription = Some(tokio::spawn(apply_changes(
            changes,
            self.records.clone(),
            wanted.clone(),
        )));
        info!("Tracking presence for {} user(s)", wanted.len());
        self.tracked = Some(wanted);
        Ok(true)
    }

    /// Cancel the current subscription. The last known rows stay readable.
    pub fn stop(&mut self) {
        if let Some(handle) = self.subscription.take() {
            handle.abort();
        }
        self.tracked = None;
    }

    pub fn record(&self, user_id: &str) -> Option<PresenceRecord> {
        self.read_records().get(user_id).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, PresenceRecord> {
        self.read_records().clone()
    }

    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.is_user_online_at(user_id, Utc::now())
    }

    pub fn is_user_online_at(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        self.read_records()
            .get(user_id)
            .map(|record| is_online(record, now, self.stale_after))
            .unwrap_or(false)
    }

    fn read_records(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, PresenceRecord>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_records(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, PresenceRecord>> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn apply_changes(
    mut changes: mpsc::Receiver<PresenceChange>,
    records: Arc<RwLock<HashMap<String, PresenceRecord>>>,
    tracked: BTreeSet<String>,
) {
    while let Some(change) = changes.recv().await {
        if !tracked.contains(change.user_id()) {
            continue;
        }
        let mut records = records.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        match change {
            PresenceChange::Upsert(record) => {
                debug!("Presence of {} is now {:?}", record.user_id, record.status);
                records.insert(record.user_id.clone(), record);
            }
            PresenceChange::Delete { user_id } => {
                debug!("Presence row of {} removed", user_id);
                records.remove(&user_id);
            }
        }
    }
    debug!("Presence change stream ended");
}

/// Reads `user_presence` over REST and turns periodic reloads into changes.
pub struct RestPresenceSource {
    http: Client,
    table_url: String,
    anon_key: String,
    session: Arc<dyn SessionProvider>,
    poll_interval: Duration,
}

impl RestPresenceSource {
    pub fn new(config: &ClientConfig, session: Arc<dyn SessionProvider>) -> Result<Self, PresenceError> {
        Ok(Self {
            http: Client::builder().timeout(config.function_timeout).build()?,
            table_url: config.rest_url(endpoints::PRESENCE_TABLE),
            anon_key: config.anon_key.clone(),
            session,
            poll_interval: config.presence_poll_interval,
        })
    }

    async fn fetch(
        http: &Client,
        table_url: &str,
        anon_key: &str,
        token: &str,
        user_ids: &[String],
    ) -> Result<Vec<PresenceRecord>, PresenceError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let quoted: Vec<String> = user_ids.iter().map(|id| format!("\"{}\"", id)).collect();
        let filter = format!("in.({})", quoted.join(","));

        let response = http
            .get(table_url)
            .query(&[("select", "user_id,status,last_seen,updated_at"), ("user_id", filter.as_str())])
            .header("apikey", anon_key)
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PresenceError::Status { status: status.as_u16(), body });
        }
        Ok(response.json().await?)
    }
}

/// Changes that turn `previous` into `current`.
pub fn diff_presence(previous: &HashMap<String, PresenceRecord>, current: &[PresenceRecord]) -> Vec<PresenceChange> {
    let mut changes = Vec::new();
    for record in current {
        if previous.get(&record.user_id) != Some(record) {
            changes.push(PresenceChange::Upsert(record.clone()));
        }
    }
    let present: BTreeSet<&str> = current.iter().map(|r| r.user_id.as_str()).collect();
    let mut removed: Vec<&String> = previous.keys().filter(|id| !present.contains(id.as_str())).collect();
    removed.sort();
    for user_id in removed {
        changes.push(PresenceChange::Delete { user_id: user_id.clone() });
    }
    changes
}

#[async_trait]
impl PresenceSource for RestPresenceSource {
    async fn load(&self, user_ids: &[String]) -> Result<Vec<PresenceRecord>, PresenceError> {
        let token = self.session.access_token().await?;
        Self::fetch(&self.http, &self.table_url, &self.anon_key, &token, user_ids).await
    }

    async fn subscribe(
        &self,
        user_ids: &[String],
        baseline: &[PresenceRecord],
    ) -> Result<mpsc::Receiver<PresenceChange>, PresenceError> {
        let (tx, rx) = mpsc::channel(100);
        let mut previous: HashMap<String, PresenceRecord> =
            baseline.iter().map(|r| (r.user_id.clone(), r.clone())).collect();

        let http = self.http.clone();
        let table_url = self.table_url.clone();
        let anon_key = self.anon_key.clone();
        let session = self.session.clone();
        let poll_interval = self.poll_interval;
        let user_ids = user_ids.to_vec();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }
                let token = match session.access_token().await {
                    Ok(token) => token,
                    Err(e) => {
                        warn!("Skipping presence poll: {}", e);
                        continue;
                    }
                };
                let current = match Self::fetch(&http, &table_url, &anon_key, &token, &user_ids).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        error!("Presence poll failed: {}", e);
                        continue;
                    }
                };
                for change in diff_presence(&previous, &current) {
                    if tx.send(change).await.is_err() {
                        return;
                    }
                }
                previous = current.into_iter().map(|r| (r.user_id.clone(), r)).collect();
            }
        });

        Ok(rx)
    }
}
