use crate::store::SqliteEventStore;
use base64::Engine as _;
use chrono::SecondsFormat;
use facelog_core::RecognitionEvent;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("cannot prepare storage location: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] tokio_rusqlite::Error),
    #[error("event log request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("event log rejected event: HTTP {0}")]
    Rejected(u16),
}

/// Durable sink for accepted recognition events. Failures go back to the
/// caller and are never retried here.
pub trait EventPersister: Send + Sync + 'static {
    fn persist(
        &self,
        event: &RecognitionEvent,
    ) -> impl Future<Output = Result<(), PersistError>> + Send;
}

/// Body of a remote event log entry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogEntry<'a> {
    employee_id: &'a str,
    name: &'a str,
    status: &'static str,
    timestamp: String,
    confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<SnapshotPayload<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotPayload<'a> {
    content_type: &'a str,
    /// Standard base64.
    data: String,
}

impl<'a> LogEntry<'a> {
    fn from_event(event: &'a RecognitionEvent) -> Self {
        Self {
            employee_id: &event.identity_id,
            name: &event.display_name,
            status: "success",
            timestamp: event.occurred_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            confidence: event.confidence,
            snapshot: event.snapshot.as_ref().map(|s| SnapshotPayload {
                content_type: &s.content_type,
                data: base64::engine::general_purpose::STANDARD.encode(&s.data),
            }),
        }
    }
}

/// Remote event log reached over HTTP POST.
pub struct HttpEventLog {
    client: reqwest::Client,
    url: String,
}

impl HttpEventLog {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, PersistError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("facelogd/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl EventPersister for HttpEventLog {
    async fn persist(&self, event: &RecognitionEvent) -> Result<(), PersistError> {
        let response = self
            .client
            .post(&self.url)
            .json(&LogEntry::from_event(event))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PersistError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Persister selected by configuration.
pub enum Persister {
    Sqlite(SqliteEventStore),
    Http(HttpEventLog),
}

impl Persister {
    /// Most recent events, newest first. Only the local store can answer this.
    pub async fn recent(
        &self,
        limit: usize,
    ) -> Result<Option<Vec<RecognitionEvent>>, PersistError> {
        match self {
            Self::Sqlite(store) => Ok(Some(store.recent(limit).await?)),
            Self::Http(_) => Ok(None),
        }
    }
}

impl EventPersister for Persister {
    async fn persist(&self, event: &RecognitionEvent) -> Result<(), PersistError> {
        match self {
            Self::Sqlite(store) => store.persist(event).await,
            Self::Http(log) => log.persist(event).await,
        }
    }
}
