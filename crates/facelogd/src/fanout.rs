use crate::notify::{NotifyError, Notifier};
use crate::stats::PipelineStats;
use facelog_core::{NotificationTarget, RecognitionEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of one recipient's delivery.
#[derive(Debug)]
pub struct Delivery {
    pub target: NotificationTarget,
    pub result: Result<(), NotifyError>,
    pub elapsed: Duration,
}

/// Everything that completed before the broadcast finished or was cancelled.
#[derive(Debug, Default)]
pub struct FanoutReport {
    pub deliveries: Vec<Delivery>,
    /// Deliveries still running when the broadcast was cancelled.
    pub abandoned: usize,
}

impl FanoutReport {
    pub fn succeeded(&self) -> usize {
        self.deliveries.iter().filter(|d| d.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.deliveries.iter().filter(|d| d.result.is_err()).count()
    }
}

/// One concurrent delivery per recipient, each bounded by its own timeout.
/// Nothing is retried.
pub struct Fanout<N> {
    notifier: Arc<N>,
    timeout: Duration,
    stats: Arc<PipelineStats>,
}

impl<N> Clone for Fanout<N> {
    fn clone(&self) -> Self {
        Self {
            notifier: Arc::clone(&self.notifier),
            timeout: self.timeout,
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<N: Notifier> Fanout<N> {
    pub fn new(notifier: Arc<N>, timeout: Duration, stats: Arc<PipelineStats>) -> Self {
        Self {
            notifier,
            timeout,
            stats,
        }
    }

    /// Deliver `event` to every target concurrently.
    ///
    /// Returns once every delivery has succeeded, failed or timed out, or
    /// when `cancel` fires, in which case outstanding deliveries are aborted.
    pub async fn broadcast(
        &self,
        event: &RecognitionEvent,
        targets: &[NotificationTarget],
        cancel: &CancellationToken,
    ) -> FanoutReport {
        let message: Arc<str> = event.notification_message().into();
        let mut set = JoinSet::new();

        for target in targets.iter().cloned() {
            let notifier = Arc::clone(&self.notifier);
            let message = Arc::clone(&message);
            let timeout = self.timeout;
            set.spawn(async move {
                let started = Instant::now();
                let delivery = notifier.deliver(&target, &message);
                let result = match tokio::time::timeout(timeout, delivery).await {
                    Ok(result) => result,
                    Err(_) => Err(NotifyError::Timeout),
                };
                Delivery {
                    target,
                    result,
                    elapsed: started.elapsed(),
                }
            });
        }

        let mut report = FanoutReport::default();
        loop {
            tokio::select! {
                joined = set.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok(delivery) => {
                            self.record(event, &delivery);
                            report.deliveries.push(delivery);
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "notification task panicked");
                            PipelineStats::incr(&self.stats.notifications_failed);
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    report.abandoned = set.len();
                    set.abort_all();
                    if report.abandoned > 0 {
                        tracing::info!(
                            identity = %event.identity_id,
                            abandoned = report.abandoned,
                            "shutdown: abandoning in-flight notifications"
                        );
                    }
                    break;
                }
            }
        }
        report
    }

    fn record(&self, event: &RecognitionEvent, delivery: &Delivery) {
        match &delivery.result {
            Ok(()) => {
                PipelineStats::incr(&self.stats.notifications_sent);
                tracing::debug!(
                    identity = %event.identity_id,
                    channel = %delivery.target.channel_id,
                    elapsed_ms = delivery.elapsed.as_millis() as u64,
                    "notification delivered"
                );
            }
            Err(err) => {
                PipelineStats::incr(&self.stats.notifications_failed);
                tracing::warn!(
                    identity = %event.identity_id,
                    channel = %delivery.target.channel_id,
                    error = %err,
                    "notification failed"
                );
            }
        }
    }
}
