use facelog_core::{MatchCandidate, MatchOutcome, MatchSource, SourceError, Snapshot};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// An encoded frame (JPEG/PNG) dropped into the spool by the capture process.
#[derive(Debug, Clone)]
pub struct SpooledFrame {
    pub path: PathBuf,
    pub content_type: &'static str,
    pub data: Vec<u8>,
}

fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        _ => None,
    }
}

/// Newest-frame reader over a spool directory.
pub struct SpoolFrameSource {
    dir: PathBuf,
    /// Frames older than this mean the capture process has stalled.
    max_age: Duration,
    last_seen: Mutex<Option<(PathBuf, SystemTime)>>,
}

impl SpoolFrameSource {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
            last_seen: Mutex::new(None),
        }
    }

    /// Newest frame not returned before, or `None` if nothing new arrived.
    pub async fn next_frame(&self) -> Result<Option<SpooledFrame>, SourceError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            SourceError::Unavailable(format!("spool {}: {e}", self.dir.display()))
        })?;

        let mut newest: Option<(PathBuf, &'static str, SystemTime)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SourceError::Transient(format!("spool scan: {e}")))?
        {
            let path = entry.path();
            let Some(content_type) = content_type_for(&path) else {
                continue;
            };
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if newest.as_ref().map_or(true, |(_, _, m)| modified > *m) {
                newest = Some((path, content_type, modified));
            }
        }

        let Some((path, content_type, modified)) = newest else {
            return Err(SourceError::Unavailable(format!(
                "no frames in spool {}",
                self.dir.display()
            )));
        };

        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age > self.max_age {
            return Err(SourceError::Unavailable(format!(
                "newest frame is {}s old; capture stalled",
                age.as_secs()
            )));
        }

        {
            let mut last = self.last_seen.lock().unwrap_or_else(|p| p.into_inner());
            if last.as_ref() == Some(&(path.clone(), modified)) {
                return Ok(None);
            }
            *last = Some((path.clone(), modified));
        }

        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| SourceError::Transient(format!("read {}: {e}", path.display())))?;
        Ok(Some(SpooledFrame {
            path,
            content_type,
            data,
        }))
    }
}

/// Verification service reply. `null` means no face in the frame.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    identity_id: Option<String>,
    #[serde(default)]
    confidence: f32,
}

fn outcome_from_response(body: &str, snapshot: Snapshot) -> Result<MatchOutcome, SourceError> {
    let reply: Option<VerifyResponse> = serde_json::from_str(body)
        .map_err(|e| SourceError::Transient(format!("bad verify response: {e}")))?;
    Ok(match reply {
        None => MatchOutcome::NoFace,
        Some(reply) => MatchOutcome::Face {
            candidate: MatchCandidate {
                identity_id: reply.identity_id.filter(|id| !id.is_empty()),
                confidence: reply.confidence,
            },
            snapshot: Some(snapshot),
        },
    })
}

/// Posts the newest spooled frame to a remote verifier.
///
/// Only a missing or stalled spool makes this source unavailable. Any
/// failure talking to the verifier is transient: the loop keeps ticking.
pub struct RemoteVerifier {
    frames: SpoolFrameSource,
    client: reqwest::Client,
    url: String,
}

impl RemoteVerifier {
    pub fn new(frames: SpoolFrameSource, url: impl Into<String>) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("facelogd/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            frames,
            client,
            url: url.into(),
        })
    }
}

impl MatchSource for RemoteVerifier {
    async fn next_match(&self) -> Result<MatchOutcome, SourceError> {
        let Some(frame) = self.frames.next_frame().await? else {
            return Ok(MatchOutcome::NoFace);
        };
        tracing::trace!(frame = %frame.path.display(), bytes = frame.data.len(), "verifying frame");

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, frame.content_type)
            .body(frame.data.clone())
            .send()
            .await
            .map_err(|e| SourceError::Transient(format!("verify request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Transient(format!("verifier returned HTTP {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|e| SourceError::Transient(format!("verify response: {e}")))?;

        outcome_from_response(
            &body,
            Snapshot {
                content_type: frame.content_type.to_string(),
                data: frame.data,
            },
        )
    }
}
