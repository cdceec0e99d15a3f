use crate::persist::{EventPersister, PersistError};
use chrono::{DateTime, SecondsFormat, Utc};
use facelog_core::RecognitionEvent;
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS recognition_events (
    id            TEXT PRIMARY KEY,
    identity_id   TEXT NOT NULL,
    display_name  TEXT NOT NULL,
    occurred_at   TEXT NOT NULL,
    confidence    REAL NOT NULL,
    snapshot_type TEXT,
    snapshot      BLOB
);
CREATE INDEX IF NOT EXISTS idx_events_occurred_at ON recognition_events (occurred_at);
CREATE INDEX IF NOT EXISTS idx_events_identity ON recognition_events (identity_id);
";

/// Append-only log of accepted events.
pub struct SqliteEventStore {
    conn: Connection,
}

impl SqliteEventStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).await?;
        let store = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "event store opened");
        Ok(store)
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, PersistError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, PersistError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Most recent events, newest first. Snapshots are not loaded.
    pub async fn recent(&self, limit: usize) -> Result<Vec<RecognitionEvent>, PersistError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let events = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity_id, display_name, occurred_at, confidence
                     FROM recognition_events
                     ORDER BY occurred_at DESC
                     LIMIT ?1",
                )?;
                let rows = stmt.query_map([limit], |row| {
                    let occurred_at: String = row.get(2)?;
                    let occurred_at = DateTime::parse_from_rfc3339(&occurred_at)
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                2,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?
                        .with_timezone(&Utc);
                    Ok(RecognitionEvent {
                        identity_id: row.get(0)?,
                        display_name: row.get(1)?,
                        occurred_at,
                        confidence: row.get::<_, f64>(3)? as f32,
                        snapshot: None,
                    })
                })?;
                let events = rows.collect::<Result<Vec<_>, _>>()?;
                Ok(events)
            })
            .await?;
        Ok(events)
    }

    #[cfg(test)]
    pub async fn count(&self) -> Result<u64, PersistError> {
        let n = self
            .conn
            .call(|conn| {
                let n: i64 =
                    conn.query_row("SELECT COUNT(*) FROM recognition_events", [], |r| r.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(n.max(0) as u64)
    }
}

impl EventPersister for SqliteEventStore {
    async fn persist(&self, event: &RecognitionEvent) -> Result<(), PersistError> {
        let id = uuid::Uuid::new_v4().to_string();
        let identity_id = event.identity_id.clone();
        let display_name = event.display_name.clone();
        let occurred_at = event.occurred_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        let confidence = f64::from(event.confidence);
        let (snapshot_type, snapshot) = match &event.snapshot {
            Some(s) => (Some(s.content_type.clone()), Some(s.data.clone())),
            None => (None, None),
        };
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO recognition_events
                     (id, identity_id, display_name, occurred_at, confidence,
                      snapshot_type, snapshot)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        id,
                        identity_id,
                        display_name,
                        occurred_at,
                        confidence,
                        snapshot_type,
                        snapshot
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use facelog_core::Snapshot;

    fn event(id: &str, name: &str, at: DateTime<Utc>) -> RecognitionEvent {
        RecognitionEvent {
            identity_id: id.into(),
            display_name: name.into(),
            occurred_at: at,
            confidence: 0.75,
            snapshot: None,
        }
    }

    #[tokio::test]
    async fn test_persist_and_recent_newest_first() {
        let store = SqliteEventStore::open_in_memory().await.unwrap();
        let t0 = Utc::now();
        store.persist(&event("E1", "Behzod", t0)).await.unwrap();
        store
            .persist(&event("E2", "Jasur", t0 + Duration::seconds(5)))
            .await
            .unwrap();

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].identity_id, "E2");
        assert_eq!(recent[1].display_name, "Behzod");
        assert!((recent[1].confidence - 0.75).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_recent_respects_limit() {
        let store = SqliteEventStore::open_in_memory().await.unwrap();
        let t0 = Utc::now();
        for i in 0..5 {
            store
                .persist(&event("E1", "Behzod", t0 + Duration::seconds(i * 60)))
                .await
                .unwrap();
        }
        assert_eq!(store.recent(3).await.unwrap().len(), 3);
        assert_eq!(store.count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_persist_with_snapshot() {
        let store = SqliteEventStore::open_in_memory().await.unwrap();
        let mut e = event("E1", "Behzod", Utc::now());
        e.snapshot = Some(Snapshot {
            content_type: "image/jpeg".into(),
            data: vec![0xff, 0xd8, 0xff],
        });
        store.persist(&e).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_open_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/events.db");
        let store = SqliteEventStore::open(&path).await.unwrap();
        store.persist(&event("E1", "Behzod", Utc::now())).await.unwrap();
        assert!(path.exists());
    }
}
