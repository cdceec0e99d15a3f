use crate::persist::EventPersister;
use crate::stats::PipelineStats;
use facelog_core::RecognitionEvent;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One write in flight plus one queued.
const MAX_PENDING: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Nothing else was pending; the write starts right away.
    Started,
    /// Queued behind the write in flight.
    Queued,
    /// In-flight and queue slots both taken; the event was dropped.
    Busy,
    /// The writer has shut down.
    Closed,
}

/// Single-flight persistence. A dedicated writer task owns the persister;
/// at most one event is being written and at most one waits behind it.
/// A submission that finds both slots taken is rejected as
/// [`SubmitOutcome::Busy`], counted, and never retried.
pub struct WriteGuard {
    tx: mpsc::Sender<RecognitionEvent>,
    /// Events accepted by `submit` and not yet finished by the writer.
    pending: Arc<AtomicUsize>,
    stats: Arc<PipelineStats>,
}

impl WriteGuard {
    /// Start the writer task. It exits once every `WriteGuard` is dropped
    /// and the pending events have been written.
    pub fn spawn<P: EventPersister>(
        persister: Arc<P>,
        stats: Arc<PipelineStats>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RecognitionEvent>(MAX_PENDING);
        let pending = Arc::new(AtomicUsize::new(0));

        let writer = {
            let pending = Arc::clone(&pending);
            let stats = Arc::clone(&stats);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match persister.persist(&event).await {
                        Ok(()) => {
                            PipelineStats::incr(&stats.persisted);
                            if stats.is_degraded() {
                                tracing::info!("persistence recovered");
                            }
                            stats.set_degraded(false);
                            tracing::debug!(identity = %event.identity_id, "event persisted");
                        }
                        Err(err) => {
                            PipelineStats::incr(&stats.persist_failures);
                            stats.set_degraded(true);
                            tracing::warn!(
                                identity = %event.identity_id,
                                error = %err,
                                "failed to persist recognition event"
                            );
                        }
                    }
                    pending.fetch_sub(1, Ordering::AcqRel);
                }
                tracing::debug!("event writer exiting");
            })
        };

        (Self { tx, pending, stats }, writer)
    }

    /// Hand `event` to the writer without waiting for it to be written.
    pub fn submit(&self, event: RecognitionEvent) -> SubmitOutcome {
        // Reserve a slot first so the writer can never decrement below zero.
        let reserved = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_PENDING).then_some(n + 1)
            });
        let ahead = match reserved {
            Ok(ahead) => ahead,
            Err(_) => {
                PipelineStats::incr(&self.stats.persist_busy);
                tracing::warn!(
                    identity = %event.identity_id,
                    "event writer busy; dropping recognition event"
                );
                return SubmitOutcome::Busy;
            }
        };
        match self.tx.try_send(event) {
            Ok(()) if ahead == 0 => SubmitOutcome::Started,
            Ok(()) => SubmitOutcome::Queued,
            Err(err) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                match err {
                    mpsc::error::TrySendError::Closed(_) => SubmitOutcome::Closed,
                    mpsc::error::TrySendError::Full(_) => {
                        PipelineStats::incr(&self.stats.persist_busy);
                        SubmitOutcome::Busy
                    }
                }
            }
        }
    }

    /// Events submitted and not yet finished (0, 1 or 2).
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}
