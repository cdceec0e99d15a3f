use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facelog_core::Roster;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.freedesktop.FaceLog1",
    default_service = "org.freedesktop.FaceLog1",
    default_path = "/org/freedesktop/FaceLog1"
)]
trait FaceLog {
    async fn status(&self) -> zbus::Result<String>;
    async fn recent_events(&self, limit: u32) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facelog", about = "facelog recognition-event daemon CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status and pipeline counters
    Status,
    /// List the most recent recognition events
    Events {
        /// Number of events to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },
    /// Validate a roster file without starting the daemon
    Roster {
        /// Path to the roster JSON file
        path: PathBuf,
    },
}

async fn connect(session: bool) -> Result<FaceLogProxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("cannot connect to D-Bus")?;
    FaceLogProxy::new(&conn)
        .await
        .context("facelogd is not running")
}

fn pretty(raw: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(raw).context("malformed daemon reply")?;
    Ok(serde_json::to_string_pretty(&value)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let proxy = connect(cli.session).await?;
            println!("{}", pretty(&proxy.status().await?)?);
        }
        Commands::Events { limit } => {
            let proxy = connect(cli.session).await?;
            let raw = proxy.recent_events(limit).await?;
            let events: Vec<serde_json::Value> =
                serde_json::from_str(&raw).context("malformed daemon reply")?;
            if events.is_empty() {
                println!("No recognition events recorded");
            }
            for event in events {
                println!(
                    "{}  {:<24} {:<12} {:.2}",
                    event["occurredAt"].as_str().unwrap_or("?"),
                    event["displayName"].as_str().unwrap_or("?"),
                    event["identityId"].as_str().unwrap_or("?"),
                    event["confidence"].as_f64().unwrap_or(0.0),
                );
            }
        }
        Commands::Roster { path } => {
            let roster = Roster::load(&path)?;
            tracing::debug!(path = %path.display(), "roster parsed");
            println!("{}: {} identities", path.display(), roster.len());
            for identity in roster.identities() {
                println!("  {:<12} {}", identity.id, identity.display_name);
            }
        }
    }

    Ok(())
}
