use facelog_core::NotificationTarget;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid persistence target {0:?} (expected sqlite:<path> or an http(s) URL)")]
    Persistence(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Credential that must never reach logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Which message bus the status interface is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
    Off,
}

impl BusKind {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "system" => Ok(Self::System),
            "session" => Ok(Self::Session),
            "off" => Ok(Self::Off),
            other => Err(ConfigError::Invalid(format!(
                "dbus must be system, session or off, got {other:?}"
            ))),
        }
    }
}

/// Where accepted events are persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceTarget {
    Sqlite(PathBuf),
    Http(String),
}

impl PersistenceTarget {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        if let Some(path) = raw.strip_prefix("sqlite:") {
            if path.is_empty() {
                return Err(ConfigError::Persistence(raw.to_string()));
            }
            Ok(Self::Sqlite(PathBuf::from(path)))
        } else if raw.starts_with("http://") || raw.starts_with("https://") {
            Ok(Self::Http(raw.to_string()))
        } else {
            Err(ConfigError::Persistence(raw.to_string()))
        }
    }
}

/// Daemon configuration: defaults, then the TOML file, then `FACELOG_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum time between two accepted events for the same identity.
    pub cooldown: Duration,
    /// Recognition loop sampling period.
    pub sample_interval: Duration,
    /// Minimum candidate confidence for acceptance, in [0, 1].
    pub confidence_threshold: f32,
    /// Upper bound on a single Match Source call.
    pub match_timeout: Duration,
    /// Per-recipient notification delivery timeout.
    pub notify_timeout: Duration,
    /// Request timeout for the remote event log.
    pub persist_timeout: Duration,
    /// How long a feedback signal stays up before auto-clearing.
    pub feedback_duration: Duration,
    /// First pause after the match source reports itself unavailable.
    pub initial_source_backoff: Duration,
    /// Backoff ceiling; exceeding it is fatal.
    pub max_source_backoff: Duration,
    /// Soft bound on tracked cooldown entries.
    pub cooldown_max_entries: Option<usize>,
    pub notification_targets: Vec<NotificationTarget>,
    pub persistence: PersistenceTarget,
    /// JSON identity roster.
    pub roster_path: PathBuf,
    /// Directory the external capture process writes frames into.
    pub spool_dir: PathBuf,
    /// A newest frame older than this means capture has stalled.
    pub frame_max_age: Duration,
    /// Remote verification endpoint.
    pub verify_url: String,
    /// Attach the matched frame to persisted events.
    pub attach_snapshot: bool,
    /// Telegram Bot API base URL.
    pub telegram_api: String,
    /// Bot token. Environment only, never read from the config file.
    pub telegram_token: Option<Secret>,
    pub dbus: BusKind,
}

/// On-disk shape of `config.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    cooldown_secs: Option<u64>,
    sample_interval_ms: Option<u64>,
    confidence_threshold: Option<f32>,
    match_timeout_ms: Option<u64>,
    notify_timeout_ms: Option<u64>,
    persist_timeout_ms: Option<u64>,
    feedback_ms: Option<u64>,
    initial_source_backoff_ms: Option<u64>,
    max_source_backoff_ms: Option<u64>,
    cooldown_max_entries: Option<usize>,
    notification_targets: Option<Vec<String>>,
    persistence: Option<String>,
    roster_path: Option<PathBuf>,
    spool_dir: Option<PathBuf>,
    frame_max_age_ms: Option<u64>,
    verify_url: Option<String>,
    attach_snapshot: Option<bool>,
    telegram_api: Option<String>,
    dbus: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            cooldown: Duration::from_secs(60),
            sample_interval: Duration::from_millis(1000),
            confidence_threshold: 0.6,
            match_timeout: Duration::from_millis(2000),
            notify_timeout: Duration::from_millis(5000),
            persist_timeout: Duration::from_millis(10_000),
            feedback_duration: Duration::from_millis(3000),
            initial_source_backoff: Duration::from_millis(1000),
            max_source_backoff: Duration::from_secs(60),
            cooldown_max_entries: None,
            notification_targets: Vec::new(),
            persistence: PersistenceTarget::Sqlite(data_dir.join("events.db")),
            roster_path: data_dir.join("roster.json"),
            spool_dir: data_dir.join("frames"),
            frame_max_age: Duration::from_secs(10),
            verify_url: "http://127.0.0.1:8080/api/verify".to_string(),
            attach_snapshot: false,
            telegram_api: "https://api.telegram.org".to_string(),
            telegram_token: None,
            dbus: BusKind::System,
        }
    }
}

impl Config {
    /// Load from the config file (if any) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let path = std::env::var("FACELOG_CONFIG")
            .map(PathBuf::from)
            .ok()
            .or_else(|| Some(config_dir().join("config.toml")).filter(|p| p.exists()));
        if let Some(path) = path {
            config.apply_file(&path)?;
            tracing::info!(path = %path.display(), "config file loaded");
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        self.apply_toml(&raw)
    }

    fn apply_toml(&mut self, raw: &str) -> Result<(), ConfigError> {
        let file: FileConfig = toml::from_str(raw)?;
        if let Some(v) = file.cooldown_secs {
            self.cooldown = Duration::from_secs(v);
        }
        if let Some(v) = file.sample_interval_ms {
            self.sample_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.confidence_threshold {
            self.confidence_threshold = v;
        }
        if let Some(v) = file.match_timeout_ms {
            self.match_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.notify_timeout_ms {
            self.notify_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.persist_timeout_ms {
            self.persist_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.feedback_ms {
            self.feedback_duration = Duration::from_millis(v);
        }
        if let Some(v) = file.initial_source_backoff_ms {
            self.initial_source_backoff = Duration::from_millis(v);
        }
        if let Some(v) = file.max_source_backoff_ms {
            self.max_source_backoff = Duration::from_millis(v);
        }
        if file.cooldown_max_entries.is_some() {
            self.cooldown_max_entries = file.cooldown_max_entries;
        }
        if let Some(targets) = file.notification_targets {
            self.notification_targets = targets.iter().map(|t| t.as_str().into()).collect();
        }
        if let Some(v) = file.persistence {
            self.persistence = PersistenceTarget::parse(&v)?;
        }
        if let Some(v) = file.roster_path {
            self.roster_path = v;
        }
        if let Some(v) = file.spool_dir {
            self.spool_dir = v;
        }
        if let Some(v) = file.frame_max_age_ms {
            self.frame_max_age = Duration::from_millis(v);
        }
        if let Some(v) = file.verify_url {
            self.verify_url = v;
        }
        if let Some(v) = file.attach_snapshot {
            self.attach_snapshot = v;
        }
        if let Some(v) = file.telegram_api {
            self.telegram_api = v;
        }
        if let Some(v) = file.dbus {
            self.dbus = BusKind::parse(&v)?;
        }
        Ok(())
    }

    /// Overlay `FACELOG_*` variables resolved through `var`.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let var = &var;
        if let Some(v) = env_parse::<u64>(var, "FACELOG_COOLDOWN_SECS") {
            self.cooldown = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>(var, "FACELOG_SAMPLE_INTERVAL_MS") {
            self.sample_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<f32>(var, "FACELOG_CONFIDENCE_THRESHOLD") {
            self.confidence_threshold = v;
        }
        if let Some(v) = env_parse::<u64>(var, "FACELOG_MATCH_TIMEOUT_MS") {
            self.match_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>(var, "FACELOG_NOTIFY_TIMEOUT_MS") {
            self.notify_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>(var, "FACELOG_PERSIST_TIMEOUT_MS") {
            self.persist_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>(var, "FACELOG_FEEDBACK_MS") {
            self.feedback_duration = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>(var, "FACELOG_INITIAL_SOURCE_BACKOFF_MS") {
            self.initial_source_backoff = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>(var, "FACELOG_MAX_SOURCE_BACKOFF_MS") {
            self.max_source_backoff = Duration::from_millis(v);
        }
        if let Some(v) = var("FACELOG_NOTIFY_TARGETS") {
            self.notification_targets = v
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(NotificationTarget::from)
                .collect();
        }
        if let Some(v) = var("FACELOG_PERSISTENCE") {
            self.persistence = PersistenceTarget::parse(&v)?;
        }
        if let Some(v) = var("FACELOG_ROSTER") {
            self.roster_path = PathBuf::from(v);
        }
        if let Some(v) = var("FACELOG_SPOOL_DIR") {
            self.spool_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse::<u64>(var, "FACELOG_FRAME_MAX_AGE_MS") {
            self.frame_max_age = Duration::from_millis(v);
        }
        if let Some(v) = var("FACELOG_VERIFY_URL") {
            self.verify_url = v;
        }
        if let Some(v) = var("FACELOG_ATTACH_SNAPSHOT") {
            self.attach_snapshot = v != "0";
        }
        if let Some(v) = var("FACELOG_TELEGRAM_API") {
            self.telegram_api = v;
        }
        if let Some(v) = var("FACELOG_DBUS") {
            self.dbus = BusKind::parse(&v)?;
        }
        self.telegram_token = var("FACELOG_TELEGRAM_TOKEN")
            .filter(|t| !t.is_empty())
            .map(Secret);
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_interval.is_zero() {
            return Err(ConfigError::Invalid("sample interval must be non-zero".into()));
        }
        if self.match_timeout.is_zero()
            || self.notify_timeout.is_zero()
            || self.persist_timeout.is_zero()
        {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if self.initial_source_backoff.is_zero()
            || self.initial_source_backoff > self.max_source_backoff
        {
            return Err(ConfigError::Invalid(
                "initial source backoff must be non-zero and <= max source backoff".into(),
            ));
        }
        Ok(())
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("facelog")
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("facelog")
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn env_parse<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}
