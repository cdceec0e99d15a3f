use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedbackSignal {
    Success {
        identity_id: String,
        display_name: String,
    },
    Failure,
}

/// Current local feedback signal. Renderers (log, D-Bus status) watch it;
/// each signal clears itself after the display duration unless a newer one
/// replaced it first.
#[derive(Clone)]
pub struct Feedback {
    tx: Arc<watch::Sender<Option<FeedbackSignal>>>,
    generation: Arc<AtomicU64>,
    display: Duration,
}

impl Feedback {
    pub fn new(display: Duration) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
            display,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<FeedbackSignal>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<FeedbackSignal> {
        self.tx.borrow().clone()
    }

    /// Show `signal` and schedule it to clear. Must be called from a tokio runtime.
    pub fn emit(&self, signal: FeedbackSignal) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.tx.send_replace(Some(signal));

        let tx = Arc::clone(&self.tx);
        let current = Arc::clone(&self.generation);
        let display = self.display;
        tokio::spawn(async move {
            tokio::time::sleep(display).await;
            tx.send_if_modified(|value| {
                if current.load(Ordering::Acquire) == generation && value.is_some() {
                    *value = None;
                    true
                } else {
                    false
                }
            });
        });
    }

    pub fn success(&self, identity_id: &str, display_name: &str) {
        self.emit(FeedbackSignal::Success {
            identity_id: identity_id.to_string(),
            display_name: display_name.to_string(),
        });
    }

    pub fn failure(&self) {
        self.emit(FeedbackSignal::Failure);
    }
}

/// Log every feedback change until the sender side is dropped.
pub async fn log_feedback(mut rx: watch::Receiver<Option<FeedbackSignal>>) {
    while rx.changed().await.is_ok() {
        let signal = rx.borrow_and_update().clone();
        match signal {
            Some(FeedbackSignal::Success { display_name, .. }) => {
                tracing::info!(name = %display_name, "feedback: face recognized");
            }
            Some(FeedbackSignal::Failure) => tracing::info!("feedback: face not recognized"),
            None => tracing::trace!("feedback: cleared"),
        }
    }
}
