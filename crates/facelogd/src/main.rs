use anyhow::{Context, Result};
use facelog_core::{CooldownTracker, Roster};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod fanout;
mod feedback;
#[cfg(test)]
mod http_stub;
mod notify;
mod persist;
mod source;
mod stats;
mod store;
mod write_guard;

use config::{BusKind, Config, PersistenceTarget};
use engine::{EngineParts, EngineSettings};
use notify::{Outbound, TelegramNotifier};
use persist::{HttpEventLog, Persister};
use source::{RemoteVerifier, SpoolFrameSource};
use store::SqliteEventStore;

const BUS_NAME: &str = "org.freedesktop.FaceLog1";
const OBJECT_PATH: &str = "/org/freedesktop/FaceLog1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facelogd starting");

    let config = Config::load().context("failed to load configuration")?;
    let roster = Arc::new(Roster::load(&config.roster_path).context("failed to load roster")?);

    let persister = Arc::new(match &config.persistence {
        PersistenceTarget::Sqlite(path) => {
            let store = SqliteEventStore::open(path)
                .await
                .with_context(|| format!("failed to open event store {}", path.display()))?;
            tracing::info!(path = %path.display(), "persisting events to sqlite");
            Persister::Sqlite(store)
        }
        PersistenceTarget::Http(url) => {
            tracing::info!(url = %url, "persisting events to remote log");
            Persister::Http(HttpEventLog::new(url.clone(), config.persist_timeout)?)
        }
    });

    let mut targets = config.notification_targets.clone();
    let notifier = Arc::new(match &config.telegram_token {
        Some(token) => Outbound::Telegram(TelegramNotifier::new(
            &config.telegram_api,
            token.expose(),
        )?),
        None => {
            if !targets.is_empty() {
                tracing::warn!(
                    targets = targets.len(),
                    "FACELOG_TELEGRAM_TOKEN not set; notifications disabled"
                );
                targets.clear();
            }
            Outbound::Disabled
        }
    });

    let source = Arc::new(
        RemoteVerifier::new(
            SpoolFrameSource::new(&config.spool_dir, config.frame_max_age),
            config.verify_url.clone(),
        )
        .context("failed to build match source")?,
    );

    let cooldown = Arc::new(match config.cooldown_max_entries {
        Some(max) => CooldownTracker::new(config.cooldown).with_max_entries(max),
        None => CooldownTracker::new(config.cooldown),
    });
    let stats = Arc::new(stats::PipelineStats::default());
    let feedback = feedback::Feedback::new(config.feedback_duration);
    tokio::spawn(feedback::log_feedback(feedback.subscribe()));

    // Keep the connection alive for the life of the daemon.
    let _dbus = match config.dbus {
        BusKind::Off => None,
        bus => {
            let service = dbus_interface::FaceLogService {
                stats: Arc::clone(&stats),
                feedback: feedback.clone(),
                persister: Arc::clone(&persister),
                roster: Arc::clone(&roster),
                cooldown: Arc::clone(&cooldown),
                targets: targets.len(),
            };
            match register_dbus(bus, service).await {
                Ok(conn) => {
                    tracing::info!(name = BUS_NAME, "D-Bus interface registered");
                    Some(conn)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "D-Bus registration failed; continuing without it");
                    None
                }
            }
        }
    };

    let handle = engine::spawn_engine(
        source,
        notifier,
        EngineParts {
            persister,
            roster,
            cooldown,
            targets,
            notify_timeout: config.notify_timeout,
            feedback,
            stats: Arc::clone(&stats),
        },
        EngineSettings {
            sample_interval: config.sample_interval,
            confidence_threshold: config.confidence_threshold,
            match_timeout: config.match_timeout,
            initial_source_backoff: config.initial_source_backoff,
            max_source_backoff: config.max_source_backoff,
            attach_snapshot: config.attach_snapshot,
        },
    );

    tracing::info!("facelogd ready");

    let result = handle.run_until(tokio::signal::ctrl_c()).await;

    tracing::info!(stats = ?stats.snapshot(), "facelogd stopped");
    result?;
    Ok(())
}

async fn register_dbus(
    bus: BusKind,
    service: dbus_interface::FaceLogService,
) -> zbus::Result<zbus::Connection> {
    let builder = match bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        _ => zbus::connection::Builder::system()?,
    };
    builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
}
