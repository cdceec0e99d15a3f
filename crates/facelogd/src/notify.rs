use facelog_core::NotificationTarget;
use serde::Serialize;
use std::future::Future;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("delivery request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("recipient rejected message: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("delivery timed out")]
    Timeout,
}

/// Delivers a message to a single recipient. Implementations make exactly one attempt.
pub trait Notifier: Send + Sync + 'static {
    fn deliver(
        &self,
        target: &NotificationTarget,
        message: &str,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Notifier selected by configuration.
pub enum Outbound {
    Telegram(TelegramNotifier),
    /// No credentials configured; the target list is emptied at startup.
    Disabled,
}

impl Notifier for Outbound {
    async fn deliver(&self, target: &NotificationTarget, message: &str) -> Result<(), NotifyError> {
        match self {
            Self::Telegram(telegram) => telegram.deliver(target, message).await,
            Self::Disabled => {
                tracing::debug!(channel = %target.channel_id, "notifications disabled; skipping");
                Ok(())
            }
        }
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

/// Telegram Bot API `sendMessage`; the target's channel id is the chat id.
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl TelegramNotifier {
    pub fn new(api_base: &str, token: &str) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("facelogd/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/bot{token}/sendMessage", api_base.trim_end_matches('/')),
        })
    }
}

impl Notifier for TelegramNotifier {
    async fn deliver(&self, target: &NotificationTarget, message: &str) -> Result<(), NotifyError> {
        let body = SendMessage {
            chat_id: &target.channel_id,
            text: message,
            parse_mode: "Markdown",
        };
        // The endpoint embeds the bot token; keep it out of error messages.
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.without_url()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
