use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// A known, enrollable person from the roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub role: String,
    /// Reference images used by the external matcher to build descriptors.
    #[serde(default)]
    pub image_refs: Vec<String>,
}

/// Best candidate produced by one detection attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCandidate {
    /// `None` when a face was seen but matched no enrolled identity.
    pub identity_id: Option<String>,
    /// Match confidence in [0, 1]. Higher = more certain.
    pub confidence: f32,
}

impl MatchCandidate {
    pub fn unknown(confidence: f32) -> Self {
        Self {
            identity_id: None,
            confidence,
        }
    }

    pub fn known(identity_id: impl Into<String>, confidence: f32) -> Self {
        Self {
            identity_id: Some(identity_id.into()),
            confidence,
        }
    }

    /// Identity id if this candidate clears `threshold`, otherwise `None`.
    pub fn accepted_identity(&self, threshold: f32) -> Option<&str> {
        match &self.identity_id {
            Some(id) if self.confidence >= threshold => Some(id.as_str()),
            _ => None,
        }
    }
}

/// Opaque image payload captured alongside a match.
#[derive(Clone, PartialEq)]
pub struct Snapshot {
    /// MIME type, e.g. "image/jpeg".
    pub content_type: String,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("content_type", &self.content_type)
            .field("len", &self.data.len())
            .finish()
    }
}

/// What a single Match Source call produced.
#[derive(Debug, Clone)]
pub enum MatchOutcome {
    /// Nothing face-like in the frame. Not a rejection.
    NoFace,
    Face {
        candidate: MatchCandidate,
        snapshot: Option<Snapshot>,
    },
}

impl MatchOutcome {
    pub fn face(candidate: MatchCandidate) -> Self {
        Self::Face {
            candidate,
            snapshot: None,
        }
    }
}

/// An accepted "identity recognized" event. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionEvent {
    pub identity_id: String,
    pub display_name: String,
    pub occurred_at: DateTime<Utc>,
    pub confidence: f32,
    #[serde(skip)]
    pub snapshot: Option<Snapshot>,
}

impl RecognitionEvent {
    /// Human-readable notification text, timestamp in the host's local zone.
    pub fn notification_message(&self) -> String {
        format!(
            "✅ User *{}* recognized at {}!",
            self.display_name,
            self.occurred_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// A configured notification recipient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationTarget {
    pub channel_id: String,
}

impl From<&str> for NotificationTarget {
    fn from(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
        }
    }
}
