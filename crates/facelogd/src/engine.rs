use crate::fanout::Fanout;
use crate::feedback::Feedback;
use crate::notify::Notifier;
use crate::persist::EventPersister;
use crate::stats::PipelineStats;
use crate::write_guard::{SubmitOutcome, WriteGuard};
use chrono::Utc;
use facelog_core::{
    CooldownTracker, MatchOutcome, MatchSource, NotificationTarget, RecognitionEvent, Roster,
    SourceError,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("match source unavailable after {attempts} retries: {last}")]
    SourceLost { attempts: u32, last: SourceError },
    #[error("recognition loop task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Loop timing and acceptance knobs.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub sample_interval: Duration,
    pub confidence_threshold: f32,
    pub match_timeout: Duration,
    pub initial_source_backoff: Duration,
    pub max_source_backoff: Duration,
    pub attach_snapshot: bool,
}

/// Exponential backoff that gives up after one pause at the ceiling.
#[derive(Debug)]
struct Backoff {
    next: Duration,
    max: Duration,
    exhausted: bool,
    attempts: u32,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial,
            max,
            exhausted: false,
            attempts: 0,
        }
    }

    fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted {
            return None;
        }
        let delay = self.next.min(self.max);
        if delay >= self.max {
            self.exhausted = true;
        }
        self.next = self.next.saturating_mul(2);
        self.attempts += 1;
        Some(delay)
    }
}

/// What the loop did with one match outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum TickResult {
    Idle,
    Rejected,
    Suppressed,
    Accepted(SubmitOutcome),
}

/// Recognition loop: one match attempt per tick. Persistence and
/// notification run off the loop and never slow it down.
pub struct Engine<S, N> {
    source: Arc<S>,
    roster: Arc<Roster>,
    cooldown: Arc<CooldownTracker>,
    guard: WriteGuard,
    fanout: Fanout<N>,
    targets: Arc<[NotificationTarget]>,
    feedback: Feedback,
    stats: Arc<PipelineStats>,
    settings: EngineSettings,
}

/// Shared pieces the engine needs besides the source and the notifier.
pub struct EngineParts<P> {
    pub persister: Arc<P>,
    pub roster: Arc<Roster>,
    pub cooldown: Arc<CooldownTracker>,
    pub targets: Vec<NotificationTarget>,
    pub notify_timeout: Duration,
    pub feedback: Feedback,
    pub stats: Arc<PipelineStats>,
}

/// Running pipeline: the loop task plus the event writer.
pub struct EngineHandle {
    cancel: CancellationToken,
    driver: Option<JoinHandle<Result<(), EngineError>>>,
    writer: JoinHandle<()>,
}

impl EngineHandle {
    /// Resolves when the loop ends on its own, which only a fatal error does.
    /// Safe to use in `select!`; pends forever once the loop has been joined.
    pub async fn finished(&mut self) -> Result<(), EngineError> {
        let Some(driver) = self.driver.as_mut() else {
            return std::future::pending().await;
        };
        let joined = driver.await;
        self.driver = None;
        joined?
    }

    /// Stop ticking, abandon outstanding notifications, and let pending
    /// writes complete.
    pub async fn shutdown(mut self) -> Result<(), EngineError> {
        self.cancel.cancel();
        let result = match self.driver.take() {
            Some(driver) => driver.await?,
            None => Ok(()),
        };
        self.writer.await?;
        result
    }

    /// Run until the loop fails or `signal` resolves, then shut down.
    /// An error from the signal listener still leads to a full drain.
    pub async fn run_until<F>(mut self, signal: F) -> Result<(), EngineError>
    where
        F: Future<Output = std::io::Result<()>>,
    {
        let outcome = tokio::select! {
            result = self.finished() => result,
            received = signal => {
                match received {
                    Ok(()) => tracing::info!("shutdown requested"),
                    Err(e) => tracing::error!(
                        error = %e,
                        "cannot listen for shutdown signal; shutting down"
                    ),
                }
                Ok(())
            }
        };
        let drained = self.shutdown().await;
        outcome.and(drained)
    }
}

/// Start the recognition loop and its writer on the current runtime.
pub fn spawn_engine<S, N, P>(
    source: Arc<S>,
    notifier: Arc<N>,
    parts: EngineParts<P>,
    settings: EngineSettings,
) -> EngineHandle
where
    S: MatchSource,
    N: Notifier,
    P: EventPersister,
{
    let (guard, writer) = WriteGuard::spawn(parts.persister, Arc::clone(&parts.stats));
    let engine = Engine {
        source,
        roster: parts.roster,
        cooldown: parts.cooldown,
        guard,
        fanout: Fanout::new(notifier, parts.notify_timeout, Arc::clone(&parts.stats)),
        targets: parts.targets.into(),
        feedback: parts.feedback,
        stats: parts.stats,
        settings,
    };
    let cancel = CancellationToken::new();
    let driver = tokio::spawn(engine.run(cancel.clone()));
    EngineHandle {
        cancel,
        driver: Some(driver),
        writer,
    }
}

impl<S: MatchSource, N: Notifier> Engine<S, N> {
    /// Drive the loop until `cancel` fires or the source is lost for good.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), EngineError> {
        let mut ticker = tokio::time::interval(self.settings.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.settings.sample_interval.as_millis() as u64,
            threshold = self.settings.confidence_threshold,
            cooldown_secs = self.cooldown.window().as_secs(),
            targets = self.targets.len(),
            "recognition loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }
            PipelineStats::incr(&self.stats.ticks);

            match self.attempt().await {
                Ok(outcome) => {
                    self.handle(outcome, &cancel);
                }
                Err(err) if err.is_unavailable() => {
                    PipelineStats::incr(&self.stats.source_errors);
                    tracing::warn!(error = %err, "match source unavailable; pausing");
                    if !self.wait_for_source(err, &cancel).await? {
                        break;
                    }
                    ticker.reset();
                }
                Err(err) => {
                    PipelineStats::incr(&self.stats.source_errors);
                    tracing::warn!(error = %err, "match attempt failed");
                }
            }
        }

        tracing::info!(stats = ?self.stats.snapshot(), "recognition loop stopped");
        Ok(())
    }

    async fn attempt(&self) -> Result<MatchOutcome, SourceError> {
        match tokio::time::timeout(self.settings.match_timeout, self.source.next_match()).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Transient(format!(
                "match attempt exceeded {}ms",
                self.settings.match_timeout.as_millis()
            ))),
        }
    }

    /// Back off until the source answers again. Returns `false` if cancelled.
    async fn wait_for_source(
        &self,
        mut last: SourceError,
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        let mut backoff = Backoff::new(
            self.settings.initial_source_backoff,
            self.settings.max_source_backoff,
        );
        loop {
            let Some(delay) = backoff.next_delay() else {
                tracing::error!(attempts = backoff.attempts, error = %last, "match source lost");
                return Err(EngineError::SourceLost {
                    attempts: backoff.attempts,
                    last,
                });
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Ok(false),
            }
            match self.attempt().await {
                Ok(outcome) => {
                    tracing::info!(attempts = backoff.attempts, "match source recovered");
                    self.handle(outcome, cancel);
                    return Ok(true);
                }
                Err(err) if err.is_unavailable() => {
                    PipelineStats::incr(&self.stats.source_errors);
                    tracing::debug!(
                        error = %err,
                        next_delay_ms = delay.as_millis() as u64,
                        "match source still unavailable"
                    );
                    last = err;
                }
                Err(err) => {
                    // The source answered, even if this frame failed.
                    PipelineStats::incr(&self.stats.source_errors);
                    tracing::info!(error = %err, "match source recovered");
                    return Ok(true);
                }
            }
        }
    }

    /// Apply threshold and cooldown to one outcome and fire the side effects.
    fn handle(&self, outcome: MatchOutcome, cancel: &CancellationToken) -> TickResult {
        let (candidate, snapshot) = match outcome {
            MatchOutcome::NoFace => {
                tracing::trace!("no face in frame");
                return TickResult::Idle;
            }
            MatchOutcome::Face {
                candidate,
                snapshot,
            } => (candidate, snapshot),
        };

        let Some(identity_id) = candidate.accepted_identity(self.settings.confidence_threshold)
        else {
            PipelineStats::incr(&self.stats.rejected);
            tracing::debug!(
                identity = ?candidate.identity_id,
                confidence = candidate.confidence,
                "face not recognized"
            );
            self.feedback.failure();
            return TickResult::Rejected;
        };

        if !self
            .cooldown
            .try_accept(identity_id, Instant::now().into_std())
        {
            PipelineStats::incr(&self.stats.suppressed);
            tracing::debug!(identity = identity_id, "within cooldown window");
            return TickResult::Suppressed;
        }

        let display_name = match self.roster.get(identity_id) {
            Some(identity) => identity.display_name.clone(),
            None => {
                tracing::warn!(identity = identity_id, "recognized identity missing from roster");
                identity_id.to_string()
            }
        };
        let event = RecognitionEvent {
            identity_id: identity_id.to_string(),
            display_name,
            occurred_at: Utc::now(),
            confidence: candidate.confidence,
            snapshot: snapshot.filter(|_| self.settings.attach_snapshot),
        };

        PipelineStats::incr(&self.stats.accepted);
        tracing::info!(
            identity = %event.identity_id,
            name = %event.display_name,
            confidence = event.confidence,
            "face recognized"
        );
        self.feedback.success(&event.identity_id, &event.display_name);

        if !self.targets.is_empty() {
            let fanout = self.fanout.clone();
            let targets = Arc::clone(&self.targets);
            let cancel = cancel.clone();
            let event = event.clone();
            tokio::spawn(async move {
                let report = fanout.broadcast(&event, &targets, &cancel).await;
                tracing::debug!(
                    identity = %event.identity_id,
                    sent = report.succeeded(),
                    failed = report.failed(),
                    abandoned = report.abandoned,
                    "notification fanout finished"
                );
            });
        }

        let submitted = self.guard.submit(event);
        if submitted == SubmitOutcome::Closed {
            tracing::error!("event writer has stopped; event not persisted");
        }
        TickResult::Accepted(submitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::FeedbackSignal;
    use crate::notify::NotifyError;
    use crate::persist::PersistError;
    use facelog_core::{Identity, MatchCandidate};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted outcomes, one per call; `NoFace` once exhausted.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<MatchOutcome, SourceError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<MatchOutcome, SourceError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl MatchSource for ScriptedSource {
        async fn next_match(&self) -> Result<MatchOutcome, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or(Ok(MatchOutcome::NoFace))
        }
    }

    /// Always-unavailable source.
    struct DeadSource {
        calls: AtomicUsize,
    }

    impl MatchSource for DeadSource {
        async fn next_match(&self) -> Result<MatchOutcome, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::Unavailable("camera unplugged".into()))
        }
    }

    /// Source that never answers within the timeout.
    struct SlowSource;

    impl MatchSource for SlowSource {
        async fn next_match(&self) -> Result<MatchOutcome, SourceError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(MatchOutcome::NoFace)
        }
    }

    #[derive(Default)]
    struct MemoryPersister {
        events: Mutex<Vec<RecognitionEvent>>,
    }

    impl EventPersister for MemoryPersister {
        async fn persist(&self, event: &RecognitionEvent) -> Result<(), PersistError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl Notifier for RecordingNotifier {
        async fn deliver(
            &self,
            target: &NotificationTarget,
            message: &str,
        ) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .unwrap()
                .push((target.channel_id.clone(), message.to_string()));
            Ok(())
        }
    }

    fn roster() -> Arc<Roster> {
        Arc::new(
            Roster::from_identities(vec![Identity {
                id: "E1".into(),
                display_name: "Behzod".into(),
                role: "engineer".into(),
                image_refs: vec![],
            }])
            .unwrap(),
        )
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            sample_interval: Duration::from_millis(1000),
            confidence_threshold: 0.6,
            match_timeout: Duration::from_millis(500),
            initial_source_backoff: Duration::from_secs(1),
            max_source_backoff: Duration::from_secs(8),
            attach_snapshot: false,
        }
    }

    struct Harness {
        persister: Arc<MemoryPersister>,
        notifier: Arc<RecordingNotifier>,
        feedback: Feedback,
        stats: Arc<PipelineStats>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                persister: Arc::new(MemoryPersister::default()),
                notifier: Arc::new(RecordingNotifier::default()),
                feedback: Feedback::new(Duration::from_secs(3)),
                stats: Arc::new(PipelineStats::default()),
            }
        }

        fn engine<S: MatchSource>(
            &self,
            source: Arc<S>,
            cooldown: Duration,
        ) -> (Engine<S, RecordingNotifier>, JoinHandle<()>) {
            let (guard, writer) =
                WriteGuard::spawn(Arc::clone(&self.persister), Arc::clone(&self.stats));
            let engine = Engine {
                source,
                roster: roster(),
                cooldown: Arc::new(CooldownTracker::new(cooldown)),
                guard,
                fanout: Fanout::new(
                    Arc::clone(&self.notifier),
                    Duration::from_secs(5),
                    Arc::clone(&self.stats),
                ),
                targets: vec![NotificationTarget::from("ops")].into(),
                feedback: self.feedback.clone(),
                stats: Arc::clone(&self.stats),
                settings: settings(),
            };
            (engine, writer)
        }

        fn persisted(&self) -> Vec<RecognitionEvent> {
            self.persister.events.lock().unwrap().clone()
        }
    }

    fn idle_source() -> Arc<ScriptedSource> {
        Arc::new(ScriptedSource::new(vec![]))
    }

    fn face(id: &str, confidence: f32) -> MatchOutcome {
        MatchOutcome::face(MatchCandidate::known(id, confidence))
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_scenario() {
        // window 8000ms: E1 at t=0 accepted, t=5000 suppressed, t=9000 accepted.
        let h = Harness::new();
        let (engine, writer) = h.engine(idle_source(), Duration::from_millis(8000));
        let cancel = CancellationToken::new();

        assert!(matches!(engine.handle(face("E1", 0.9), &cancel), TickResult::Accepted(_)));
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(engine.handle(face("E1", 0.9), &cancel), TickResult::Suppressed);
        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert!(matches!(engine.handle(face("E1", 0.9), &cancel), TickResult::Accepted(_)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(engine);
        writer.await.unwrap();
        let persisted = h.persisted();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].display_name, "Behzod");
        assert_eq!(h.notifier.sent.lock().unwrap().len(), 2);
        assert_eq!(h.stats.snapshot().suppressed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_candidate_gives_no_feedback() {
        let h = Harness::new();
        let (engine, _writer) = h.engine(idle_source(), Duration::from_secs(60));
        let cancel = CancellationToken::new();

        engine.handle(face("E1", 0.9), &cancel);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(h.feedback.current(), None);
        engine.handle(face("E1", 0.9), &cancel);
        assert_eq!(h.feedback.current(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_confidence_is_rejected() {
        let h = Harness::new();
        let (engine, writer) = h.engine(idle_source(), Duration::from_secs(60));
        let cancel = CancellationToken::new();

        assert_eq!(engine.handle(face("E1", 0.4), &cancel), TickResult::Rejected);
        assert_eq!(h.feedback.current(), Some(FeedbackSignal::Failure));

        drop(engine);
        writer.await.unwrap();
        assert!(h.persisted().is_empty());
        assert!(h.notifier.sent.lock().unwrap().is_empty());
        assert_eq!(h.stats.snapshot().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_face_is_idle() {
        let h = Harness::new();
        let (engine, _writer) = h.engine(idle_source(), Duration::from_secs(60));
        let result = engine.handle(MatchOutcome::NoFace, &CancellationToken::new());
        assert_eq!(result, TickResult::Idle);
        assert_eq!(h.feedback.current(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_identity_uses_id_as_name() {
        let h = Harness::new();
        let (engine, writer) = h.engine(idle_source(), Duration::from_secs(60));
        engine.handle(face("E404", 0.95), &CancellationToken::new());
        drop(engine);
        writer.await.unwrap();
        assert_eq!(h.persisted()[0].display_name, "E404");
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_on_cadence_until_cancelled() {
        let h = Harness::new();
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(face("E1", 0.9)),
            Ok(face("E1", 0.9)),
            Ok(MatchOutcome::NoFace),
            Ok(face("E1", 0.3)),
        ]));
        let (engine, writer) = h.engine(Arc::clone(&source), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let run = tokio::spawn(engine.run(cancel.clone()));

        // Ticks at t=0,1,2,3,4.
        tokio::time::sleep(Duration::from_millis(4500)).await;
        cancel.cancel();
        run.await.unwrap().unwrap();
        writer.await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
        assert_eq!(h.persisted().len(), 1);
        let snap = h.stats.snapshot();
        assert_eq!(snap.accepted, 1);
        assert_eq!(snap.suppressed, 1);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.ticks, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_do_not_stop_loop() {
        let h = Harness::new();
        let source = Arc::new(ScriptedSource::new(vec![
            Err(SourceError::Transient("decode failed".into())),
            Ok(face("E1", 0.9)),
        ]));
        let (engine, writer) = h.engine(Arc::clone(&source), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let run = tokio::spawn(engine.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        run.await.unwrap().unwrap();
        writer.await.unwrap();

        assert_eq!(h.persisted().len(), 1);
        assert_eq!(h.stats.snapshot().source_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_times_out_per_tick() {
        let h = Harness::new();
        let (engine, _writer) = h.engine(Arc::new(SlowSource), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let run = tokio::spawn(engine.run(cancel.clone()));

        // Each tick: 500ms timeout, then the next tick 1s after the previous.
        tokio::time::sleep(Duration::from_millis(3200)).await;
        cancel.cancel();
        run.await.unwrap().unwrap();
        assert!(h.stats.snapshot().source_errors >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_recovers_after_backoff() {
        let h = Harness::new();
        let source = Arc::new(ScriptedSource::new(vec![
            Err(SourceError::Unavailable("no frames".into())),
            Err(SourceError::Unavailable("no frames".into())),
            Ok(face("E1", 0.9)),
        ]));
        let (engine, writer) = h.engine(Arc::clone(&source), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let run = tokio::spawn(engine.run(cancel.clone()));

        // t=0 unavailable, retry at t=1 unavailable, retry at t=3 recovers.
        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);

        cancel.cancel();
        run.await.unwrap().unwrap();
        writer.await.unwrap();
        assert_eq!(h.persisted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_lost_past_max_backoff_is_fatal() {
        let h = Harness::new();
        let source = Arc::new(DeadSource {
            calls: AtomicUsize::new(0),
        });
        let (engine, _writer) = h.engine(Arc::clone(&source), Duration::from_secs(60));

        let err = engine.run(CancellationToken::new()).await.unwrap_err();
        // Backoff 1, 2, 4, 8 (ceiling) then give up: 1 tick + 4 probes.
        assert!(matches!(err, EngineError::SourceLost { attempts: 4, .. }), "got {err:?}");
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_pending_write() {
        struct SlowPersister {
            done: AtomicUsize,
        }
        impl EventPersister for SlowPersister {
            async fn persist(&self, _event: &RecognitionEvent) -> Result<(), PersistError> {
                tokio::time::sleep(Duration::from_secs(2)).await;
                self.done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let persister = Arc::new(SlowPersister {
            done: AtomicUsize::new(0),
        });
        let handle = spawn_engine(
            Arc::new(ScriptedSource::new(vec![Ok(face("E1", 0.9))])),
            Arc::new(RecordingNotifier::default()),
            EngineParts {
                persister: Arc::clone(&persister),
                roster: roster(),
                cooldown: Arc::new(CooldownTracker::new(Duration::from_secs(60))),
                targets: vec![],
                notify_timeout: Duration::from_secs(5),
                feedback: Feedback::new(Duration::from_secs(3)),
                stats: Arc::new(PipelineStats::default()),
            },
            settings(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await.unwrap();
        assert_eq!(persister.done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_kept_only_when_enabled() {
        let h = Harness::new();
        let (mut engine, writer) = h.engine(idle_source(), Duration::from_secs(60));
        let with_frame = |id: &str| MatchOutcome::Face {
            candidate: MatchCandidate::known(id, 0.9),
            snapshot: Some(facelog_core::Snapshot {
                content_type: "image/jpeg".into(),
                data: vec![0xff, 0xd8],
            }),
        };
        let cancel = CancellationToken::new();

        engine.handle(with_frame("E1"), &cancel);
        engine.settings.attach_snapshot = true;
        engine.handle(with_frame("E2"), &cancel);

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(engine);
        writer.await.unwrap();
        let persisted = h.persisted();
        assert!(persisted[0].snapshot.is_none());
        assert!(persisted[1].snapshot.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_side_effects_do_not_block_ticks() {
        struct StuckPersister;
        impl EventPersister for StuckPersister {
            async fn persist(&self, _event: &RecognitionEvent) -> Result<(), PersistError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
        }
        struct StuckNotifier;
        impl Notifier for StuckNotifier {
            async fn deliver(
                &self,
                _target: &NotificationTarget,
                _message: &str,
            ) -> Result<(), NotifyError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let source = Arc::new(ScriptedSource::new(vec![
            Ok(face("E1", 0.9)),
            Ok(face("E2", 0.9)),
            Ok(face("E3", 0.9)),
            Ok(face("E4", 0.9)),
        ]));
        let stats = Arc::new(PipelineStats::default());
        let handle = spawn_engine(
            Arc::clone(&source),
            Arc::new(StuckNotifier),
            EngineParts {
                persister: Arc::new(StuckPersister),
                roster: roster(),
                cooldown: Arc::new(CooldownTracker::new(Duration::from_secs(60))),
                targets: vec![NotificationTarget::from("ops")],
                notify_timeout: Duration::from_secs(600),
                feedback: Feedback::new(Duration::from_secs(3)),
                stats: Arc::clone(&stats),
            },
            settings(),
        );

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 4);
        // One write in flight, one queued, the rest dropped.
        assert_eq!(snap.persist_busy, 2);

        handle.shutdown().await.unwrap();
        assert_eq!(stats.snapshot().persisted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_signal_listener_still_drains_writes() {
        struct SlowPersister {
            done: AtomicUsize,
        }
        impl EventPersister for SlowPersister {
            async fn persist(&self, _event: &RecognitionEvent) -> Result<(), PersistError> {
                tokio::time::sleep(Duration::from_secs(2)).await;
                self.done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let persister = Arc::new(SlowPersister {
            done: AtomicUsize::new(0),
        });
        let handle = spawn_engine(
            Arc::new(ScriptedSource::new(vec![Ok(face("E1", 0.9))])),
            Arc::new(RecordingNotifier::default()),
            EngineParts {
                persister: Arc::clone(&persister),
                roster: roster(),
                cooldown: Arc::new(CooldownTracker::new(Duration::from_secs(60))),
                targets: vec![],
                notify_timeout: Duration::from_secs(5),
                feedback: Feedback::new(Duration::from_secs(3)),
                stats: Arc::new(PipelineStats::default()),
            },
            settings(),
        );

        let broken_signal = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err(std::io::Error::other("signal handler unavailable"))
        };
        handle.run_until(broken_signal).await.unwrap();
        assert_eq!(persister.done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_reports_fatal_loop_exit() {
        let h = Harness::new();
        let handle = spawn_engine(
            Arc::new(DeadSource {
                calls: AtomicUsize::new(0),
            }),
            Arc::clone(&h.notifier),
            EngineParts {
                persister: Arc::clone(&h.persister),
                roster: roster(),
                cooldown: Arc::new(CooldownTracker::new(Duration::from_secs(60))),
                targets: vec![],
                notify_timeout: Duration::from_secs(5),
                feedback: h.feedback.clone(),
                stats: Arc::clone(&h.stats),
            },
            settings(),
        );

        let err = handle
            .run_until(std::future::pending::<std::io::Result<()>>())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceLost { .. }));
    }

    #[test]
    fn test_backoff_sequence() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<_> = std::iter::from_fn(|| b.next_delay()).map(|d| d.as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 10]);
    }
}
