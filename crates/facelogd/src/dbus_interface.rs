use crate::feedback::Feedback;
use crate::persist::Persister;
use crate::stats::PipelineStats;
use facelog_core::{CooldownTracker, Roster};
use std::sync::Arc;
use zbus::interface;

/// Largest page `RecentEvents` will return.
const MAX_RECENT: u32 = 500;

/// D-Bus interface for the facelog daemon.
///
/// Bus name: org.freedesktop.FaceLog1
/// Object path: /org/freedesktop/FaceLog1
pub struct FaceLogService {
    pub stats: Arc<PipelineStats>,
    pub feedback: Feedback,
    pub persister: Arc<Persister>,
    pub roster: Arc<Roster>,
    pub cooldown: Arc<CooldownTracker>,
    pub targets: usize,
}

impl FaceLogService {
    fn status_json(&self) -> serde_json::Value {
        let stats = self.stats.snapshot();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "degraded": stats.degraded,
            "stats": stats,
            "feedback": self.feedback.current(),
            "roster_size": self.roster.len(),
            "cooldown_entries": self.cooldown.len(),
            "notification_targets": self.targets,
            "persistence": match self.persister.as_ref() {
                Persister::Sqlite(_) => "sqlite",
                Persister::Http(_) => "http",
            },
        })
    }

    async fn recent_json(&self, limit: u32) -> zbus::fdo::Result<String> {
        let limit = limit.clamp(1, MAX_RECENT) as usize;
        let events = self
            .persister
            .recent(limit)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
            .unwrap_or_default();
        serde_json::to_string(&events).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}

#[interface(name = "org.freedesktop.FaceLog1")]
impl FaceLogService {
    /// Return daemon status and pipeline counters as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json().to_string())
    }

    /// Most recent recognition events, newest first, as a JSON array.
    /// Always empty when events go to a remote log.
    async fn recent_events(&self, limit: u32) -> zbus::fdo::Result<String> {
        tracing::debug!(limit, "recent_events requested");
        self.recent_json(limit).await
    }
}
