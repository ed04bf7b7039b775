use crate::config::SyncConfig;
use crate::error::{ReportError, Result};
use crate::events::{self, report_payload, EventSink, NoopSink};
use crate::remote::{RemoteAck, RemoteError, ReportsRemote};
use crate::report::{now, FailureKind, Report, ReportPatch, SyncFailure, SyncState};
use crate::store::ReportStore;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Synced,
    Failed { retryable: bool, terminal: bool },
    /// Another attempt owns the report, or it was no longer pending.
    Skipped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycles: usize,
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl CycleSummary {
    fn record(&mut self, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Synced => {
                self.attempted += 1;
                self.synced += 1;
            }
            AttemptOutcome::Failed { .. } => {
                self.attempted += 1;
                self.failed += 1;
            }
            AttemptOutcome::Skipped => self.skipped += 1,
        }
    }

    fn absorb(&mut self, other: CycleSummary) {
        self.cycles += other.cycles;
        self.attempted += other.attempted;
        self.synced += other.synced;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// Moves reports from `pending` to `synced` against a [`ReportsRemote`].
///
/// Cheap to clone; clones share the cycle guard.
pub struct SyncEngine<R: ReportsRemote> {
    inner: Arc<Inner<R>>,
}

struct Inner<R> {
    store: ReportStore,
    remote: R,
    config: SyncConfig,
    sink: Box<dyn EventSink>,
    cycle_running: AtomicBool,
    followup_requested: AtomicBool,
    /// Shared by cycles and opportunistic attempts; bounds remote calls in flight.
    send_permits: Semaphore,
}

impl<R: ReportsRemote> Clone for SyncEngine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: ReportsRemote> SyncEngine<R> {
    pub fn new(store: ReportStore, remote: R, config: SyncConfig) -> Self {
        Self::with_sink(store, remote, config, NoopSink)
    }

    pub fn with_sink(
        store: ReportStore,
        remote: R,
        config: SyncConfig,
        sink: impl EventSink,
    ) -> Self {
        let permits = config.max_in_flight.max(1);
        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                config,
                sink: Box::new(sink),
                cycle_running: AtomicBool::new(false),
                followup_requested: AtomicBool::new(false),
                send_permits: Semaphore::new(permits),
            }),
        }
    }

    pub fn store(&self) -> &ReportStore {
        &self.inner.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ReportStore) -> Result<T> + Send + 'static,
    {
        let store = self.inner.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| ReportError::Task(e.to_string()))?
    }

    /// Reports left in `syncing` by a previous process never got an answer
    /// recorded; count the attempt as a retryable failure.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let stuck = self
            .blocking(|store| store.list_by_state(SyncState::Syncing))
            .await?;
        let recovered = stuck.len();

        for report in stuck {
            let patch = ReportPatch {
                sync_state: Some(SyncState::Failed),
                last_attempt_at: Some(report.last_attempt_at.unwrap_or_else(now)),
                attempt_count: Some(report.attempt_count + 1),
                failure: Some(Some(SyncFailure {
                    kind: FailureKind::Retryable,
                    message: "interrupted before the remote answered".into(),
                })),
            };
            let id = report.id.clone();
            self.blocking(move |store| store.update(&id, patch)).await?;
            tracing::warn!(report_id = %report.id, "recovered interrupted sync attempt");
        }

        Ok(recovered)
    }

    /// Runs a sync cycle unless one is already running, in which case a
    /// single follow-up cycle is scheduled and `None` is returned.
    pub async fn run_cycle(&self) -> Result<Option<CycleSummary>> {
        if self.inner.cycle_running.swap(true, Ordering::AcqRel) {
            self.inner.followup_requested.store(true, Ordering::Release);
            tracing::debug!("sync cycle already running; follow-up scheduled");
            return Ok(None);
        }
        self.drain_cycles().await.map(Some)
    }

    async fn drain_cycles(&self) -> Result<CycleSummary> {
        let mut total = CycleSummary::default();
        loop {
            self.inner.followup_requested.store(false, Ordering::Release);
            match self.cycle_once().await {
                Ok(summary) => total.absorb(summary),
                Err(err) => {
                    self.inner.cycle_running.store(false, Ordering::Release);
                    return Err(err);
                }
            }
            if self.inner.followup_requested.load(Ordering::Acquire) {
                continue;
            }

            self.inner.cycle_running.store(false, Ordering::Release);
            // A trigger may land between the check above and the release.
            if !self.inner.followup_requested.load(Ordering::Acquire)
                || self.inner.cycle_running.swap(true, Ordering::AcqRel)
            {
                return Ok(total);
            }
        }
    }

    async fn cycle_once(&self) -> Result<CycleSummary> {
        let (pending, failed) = self
            .blocking(|store| {
                Ok((
                    store.list_by_state(SyncState::Pending)?,
                    store.list_by_state(SyncState::Failed)?,
                ))
            })
            .await?;

        let at = now();
        let mut queue: Vec<(DateTime<Utc>, String)> = pending
            .into_iter()
            .map(|r| (r.created_at, r.id))
            .collect();

        for report in failed.into_iter().filter(|r| self.is_retry_eligible(r, at)) {
            let id = report.id.clone();
            match self
                .blocking(move |store| store.update(&id, ReportPatch::state(SyncState::Pending)))
                .await
            {
                Ok(requeued) => queue.push((requeued.created_at, requeued.id)),
                Err(ReportError::InvalidTransition { .. }) => {
                    tracing::debug!(report_id = %report.id, "report changed before requeue");
                }
                Err(err) => return Err(err),
            }
        }
        queue.sort_by(|a, b| a.0.cmp(&b.0));

        let mut summary = CycleSummary {
            cycles: 1,
            ..CycleSummary::default()
        };
        let limit = self.inner.config.max_in_flight.max(1);
        let outcomes: Vec<Result<AttemptOutcome>> = stream::iter(queue)
            .map(|(_, id)| {
                let engine = self.clone();
                async move { engine.attempt(id).await }
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(outcome) => summary.record(outcome),
                Err(err) => {
                    tracing::error!(%err, "sync attempt could not be recorded");
                    summary.skipped += 1;
                }
            }
        }

        tracing::info!(
            attempted = summary.attempted,
            synced = summary.synced,
            failed = summary.failed,
            skipped = summary.skipped,
            "sync cycle completed"
        );
        self.inner.sink.emit_json(
            events::SYNC_CYCLE_COMPLETED,
            serde_json::to_value(summary).unwrap_or_default(),
        );
        Ok(summary)
    }

    /// Opportunistic attempt for one freshly submitted report.
    pub async fn sync_report(&self, id: &str) -> Result<AttemptOutcome> {
        self.attempt(id.to_string()).await
    }

    async fn attempt(&self, id: String) -> Result<AttemptOutcome> {
        // Taken before the claim so a waiting report stays `pending`.
        let _permit = self
            .inner
            .send_permits
            .acquire()
            .await
            .map_err(|e| ReportError::Task(e.to_string()))?;

        let claim_id = id.clone();
        let report = match self
            .blocking(move |store| store.update(&claim_id, ReportPatch::state(SyncState::Syncing)))
            .await
        {
            Ok(report) => report,
            Err(ReportError::InvalidTransition { from, .. }) => {
                tracing::debug!(report_id = %id, state = %from, "skipping report not ready to sync");
                return Ok(AttemptOutcome::Skipped);
            }
            Err(err) => return Err(err),
        };
        self.inner
            .sink
            .emit_json(events::REPORT_SYNCING, report_payload(&report));
        tracing::debug!(report_id = %report.id, attempt = report.attempt_count + 1, "sending report");

        let result = match report.to_wire() {
            Ok(wire) => {
                match tokio::time::timeout(
                    self.inner.config.request_timeout,
                    self.inner.remote.create_report(&wire),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::Timeout),
                }
            }
            Err(err) => Err(RemoteError::Rejected {
                status: 0,
                body: format!("report could not be encoded: {err}"),
            }),
        };

        self.record(report, result).await
    }

    async fn record(
        &self,
        report: Report,
        result: std::result::Result<RemoteAck, RemoteError>,
    ) -> Result<AttemptOutcome> {
        let id = report.id.clone();
        match result {
            Ok(ack) => {
                let patch = ReportPatch {
                    sync_state: Some(SyncState::Synced),
                    last_attempt_at: Some(now()),
                    attempt_count: None,
                    failure: Some(None),
                };
                let synced = self.blocking(move |store| store.update(&id, patch)).await?;
                tracing::info!(report_id = %synced.id, ?ack, "report synced");
                self.inner
                    .sink
                    .emit_json(events::REPORT_SYNCED, report_payload(&synced));
                Ok(AttemptOutcome::Synced)
            }
            Err(err) => {
                let retryable = err.is_retryable();
                let patch = ReportPatch {
                    sync_state: Some(SyncState::Failed),
                    last_attempt_at: Some(now()),
                    attempt_count: Some(report.attempt_count + 1),
                    failure: Some(Some(SyncFailure {
                        kind: if retryable {
                            FailureKind::Retryable
                        } else {
                            FailureKind::Rejected
                        },
                        message: err.to_string(),
                    })),
                };
                let failed = self.blocking(move |store| store.update(&id, patch)).await?;
                let terminal = failed.is_terminal_failure(self.inner.config.max_attempts);
                tracing::warn!(
                    report_id = %failed.id,
                    attempts = failed.attempt_count,
                    retryable,
                    terminal,
                    error = %err,
                    "sync attempt failed"
                );

                let payload = report_payload(&failed);
                self.inner
                    .sink
                    .emit_json(events::REPORT_FAILED, payload.clone());
                if !retryable {
                    self.inner
                        .sink
                        .emit_json(events::REPORT_NEEDS_CORRECTION, payload);
                } else if terminal {
                    self.inner
                        .sink
                        .emit_json(events::REPORT_RETRIES_EXHAUSTED, payload);
                }
                Ok(AttemptOutcome::Failed {
                    retryable,
                    terminal,
                })
            }
        }
    }

    fn is_retry_eligible(&self, report: &Report, at: DateTime<Utc>) -> bool {
        if report.sync_state != SyncState::Failed
            || report.is_terminal_failure(self.inner.config.max_attempts)
        {
            return false;
        }
        self.remaining_backoff(report, at).is_zero()
    }

    fn remaining_backoff(&self, report: &Report, at: DateTime<Utc>) -> Duration {
        let Some(last) = report.last_attempt_at else {
            return Duration::ZERO;
        };
        let delay = self.inner.config.retry_delay(report.attempt_count);
        // A last attempt "in the future" means the clock moved back; don't stall on it.
        let elapsed = at.signed_duration_since(last).to_std().unwrap_or(delay);
        delay.saturating_sub(elapsed)
    }

    /// Time until the earliest failed report becomes eligible for another
    /// automatic attempt, if any still can.
    pub async fn next_retry_delay(&self) -> Result<Option<Duration>> {
        let failed = self
            .blocking(|store| store.list_by_state(SyncState::Failed))
            .await?;
        let at = now();
        let max_attempts = self.inner.config.max_attempts;
        Ok(failed
            .iter()
            .filter(|r| !r.is_terminal_failure(max_attempts))
            .map(|r| self.remaining_backoff(r, at))
            .min())
    }

    /// Explicit user retry of a failed report: back to `pending` with a fresh
    /// attempt budget.
    pub async fn retry(&self, id: &str) -> Result<Report> {
        let id = id.to_string();
        let report = self
            .blocking(move |store| {
                let current = store.get(&id)?;
                if current.sync_state != SyncState::Failed {
                    return Err(ReportError::InvalidTransition {
                        id,
                        from: current.sync_state,
                        to: SyncState::Pending,
                    });
                }
                store.update(
                    &id,
                    ReportPatch {
                        sync_state: Some(SyncState::Pending),
                        last_attempt_at: None,
                        attempt_count: Some(0),
                        failure: Some(None),
                    },
                )
            })
            .await?;
        tracing::info!(report_id = %report.id, "report requeued by user");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{db_path, pending_report};
    use crate::testing::{CaptureSink, ScriptedRemote};

    fn test_config() -> SyncConfig {
        SyncConfig {
            max_attempts: 3,
            max_in_flight: 2,
            request_timeout: Duration::from_millis(200),
            backoff_base: Duration::ZERO,
            backoff_cap: Duration::ZERO,
            ..SyncConfig::default()
        }
    }

    fn engine_with(
        name: &str,
        remote: ScriptedRemote,
        config: SyncConfig,
    ) -> (SyncEngine<ScriptedRemote>, CaptureSink) {
        let store = ReportStore::open(db_path(name)).expect("open");
        let sink = CaptureSink::default();
        let engine = SyncEngine::with_sink(store, remote, config, sink.clone());
        (engine, sink)
    }

    #[tokio::test]
    async fn cycle_syncs_pending_reports_oldest_first() {
        let remote = ScriptedRemote::default();
        let config = SyncConfig {
            max_in_flight: 1,
            ..test_config()
        };
        let (engine, sink) = engine_with("cycle-order", remote.clone(), config);
        engine.store().put(&pending_report("young", 1)).expect("put");
        engine.store().put(&pending_report("old", 60)).expect("put");

        let summary = engine.run_cycle().await.expect("cycle").expect("ran");
        assert_eq!(summary.synced, 2);
        assert_eq!(remote.calls(), vec!["old".to_string(), "young".to_string()]);

        let synced = engine.store().get("old").expect("get");
        assert_eq!(synced.sync_state, SyncState::Synced);
        assert!(synced.last_attempt_at.is_some());
        assert!(synced.failure.is_none());

        let names = sink.names();
        assert_eq!(&names[..2], ["report-syncing", "report-synced"]);
        assert_eq!(names.last().map(String::as_str), Some("sync-cycle-completed"));
    }

    #[tokio::test]
    async fn retryable_failure_is_requeued_next_cycle() {
        let remote = ScriptedRemote::default();
        remote.push(Err(RemoteError::Server { status: 503 }));
        let (engine, _sink) = engine_with("requeue", remote.clone(), test_config());
        engine.store().put(&pending_report("r-1", 0)).expect("put");

        let first = engine.run_cycle().await.expect("cycle").expect("ran");
        assert_eq!(first.failed, 1);
        let failed = engine.store().get("r-1").expect("get");
        assert_eq!(failed.sync_state, SyncState::Failed);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(
            failed.failure.as_ref().map(|f| f.kind),
            Some(FailureKind::Retryable)
        );

        let second = engine.run_cycle().await.expect("cycle").expect("ran");
        assert_eq!(second.synced, 1);
        let synced = engine.store().get("r-1").expect("get");
        assert_eq!(synced.sync_state, SyncState::Synced);
        assert_eq!(synced.attempt_count, 1);
        assert_eq!(remote.calls().len(), 2);
    }

    #[tokio::test]
    async fn rejection_is_terminal_and_flagged_for_correction() {
        let remote = ScriptedRemote::default();
        remote.push(Err(RemoteError::Rejected {
            status: 422,
            body: "invalid severity".into(),
        }));
        let (engine, sink) = engine_with("rejected", remote.clone(), test_config());
        engine.store().put(&pending_report("r-1", 0)).expect("put");

        engine.run_cycle().await.expect("cycle");
        engine.run_cycle().await.expect("cycle");

        let report = engine.store().get("r-1").expect("get");
        assert!(report.needs_correction());
        assert!(report.is_terminal_failure(3));
        assert_eq!(remote.calls().len(), 1);
        assert!(sink.names().contains(&"report-needs-correction".to_string()));
    }

    #[tokio::test]
    async fn retries_stop_after_max_attempts() {
        let remote = ScriptedRemote::always(Err(RemoteError::Timeout));
        let (engine, sink) = engine_with("exhausted", remote.clone(), test_config());
        engine.store().put(&pending_report("r-1", 0)).expect("put");

        for _ in 0..6 {
            engine.run_cycle().await.expect("cycle");
        }

        let report = engine.store().get("r-1").expect("get");
        assert_eq!(report.sync_state, SyncState::Failed);
        assert_eq!(report.attempt_count, 3);
        assert_eq!(remote.calls().len(), 3);
        assert!(sink.names().contains(&"report-retries-exhausted".to_string()));
        assert_eq!(engine.next_retry_delay().await.expect("delay"), None);
    }

    #[tokio::test]
    async fn backoff_defers_requeue() {
        let remote = ScriptedRemote::default();
        remote.push(Err(RemoteError::Transport("connection reset".into())));
        let config = SyncConfig {
            backoff_base: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(600),
            ..test_config()
        };
        let (engine, _sink) = engine_with("backoff", remote.clone(), config);
        engine.store().put(&pending_report("r-1", 0)).expect("put");

        engine.run_cycle().await.expect("cycle");
        let summary = engine.run_cycle().await.expect("cycle").expect("ran");
        assert_eq!(summary.attempted, 0);
        assert_eq!(remote.calls().len(), 1);

        let delay = engine
            .next_retry_delay()
            .await
            .expect("delay")
            .expect("pending retry");
        assert!(delay > Duration::from_secs(50));
        assert!(delay <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn slow_remote_times_out_as_retryable() {
        let remote = ScriptedRemote::default().with_delay(Duration::from_secs(5));
        let config = SyncConfig {
            request_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let (engine, _sink) = engine_with("timeout", remote, config);
        engine.store().put(&pending_report("r-1", 0)).expect("put");

        let outcome = engine.sync_report("r-1").await.expect("attempt");
        assert_eq!(
            outcome,
            AttemptOutcome::Failed {
                retryable: true,
                terminal: false
            }
        );
        let report = engine.store().get("r-1").expect("get");
        assert_eq!(report.failure.map(|f| f.message), Some("request timed out".into()));
    }

    #[tokio::test]
    async fn concurrent_triggers_never_double_send() {
        let remote = ScriptedRemote::default().with_delay(Duration::from_millis(50));
        let (engine, _sink) = engine_with("exclusive", remote.clone(), test_config());
        engine.store().put(&pending_report("r-1", 0)).expect("put");

        let (opportunistic, cycle) = tokio::join!(engine.sync_report("r-1"), engine.run_cycle());
        opportunistic.expect("attempt");
        cycle.expect("cycle");

        assert_eq!(remote.calls(), vec!["r-1".to_string()]);
        assert_eq!(remote.max_concurrent_for("r-1"), 1);
        assert_eq!(
            engine.store().get("r-1").expect("get").sync_state,
            SyncState::Synced
        );
    }

    #[tokio::test]
    async fn remote_calls_share_one_concurrency_limit() {
        let remote = ScriptedRemote::default().with_delay(Duration::from_millis(30));
        let (engine, _sink) = engine_with("global-limit", remote.clone(), test_config());
        for n in 0..8 {
            engine
                .store()
                .put(&pending_report(&format!("r-{n}"), n))
                .expect("put");
        }

        let opportunistic = futures::future::join_all((0..4).map(|n| {
            let engine = engine.clone();
            async move { engine.sync_report(&format!("r-{n}")).await }
        }));
        let (attempts, cycle) = tokio::join!(opportunistic, engine.run_cycle());
        for attempt in attempts {
            attempt.expect("attempt");
        }
        cycle.expect("cycle");

        assert_eq!(remote.calls().len(), 8);
        assert!(remote.max_concurrent() <= 2, "saw {}", remote.max_concurrent());
        assert_eq!(
            engine.store().count_by_state().expect("counts").synced,
            8
        );
    }

    #[tokio::test]
    async fn overlapping_cycle_requests_collapse_into_one_follow_up() {
        let remote = ScriptedRemote::default().with_delay(Duration::from_millis(50));
        let (engine, _sink) = engine_with("follow-up", remote.clone(), test_config());
        engine.store().put(&pending_report("r-1", 0)).expect("put");

        let running = engine.clone();
        let first = tokio::spawn(async move { running.run_cycle().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(engine.run_cycle().await.expect("deferred"), None);
        assert_eq!(engine.run_cycle().await.expect("deferred"), None);

        let summary = first.await.expect("join").expect("cycle").expect("ran");
        assert_eq!(summary.cycles, 2);
        assert_eq!(summary.synced, 1);
        assert_eq!(remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn recovers_reports_stuck_in_syncing() {
        let (engine, _sink) = engine_with("recover", ScriptedRemote::default(), test_config());
        engine.store().put(&pending_report("r-1", 0)).expect("put");
        engine
            .store()
            .update("r-1", ReportPatch::state(SyncState::Syncing))
            .expect("claim");

        assert_eq!(engine.recover_interrupted().await.expect("recover"), 1);
        let report = engine.store().get("r-1").expect("get");
        assert_eq!(report.sync_state, SyncState::Failed);
        assert_eq!(report.attempt_count, 1);

        engine.run_cycle().await.expect("cycle");
        assert_eq!(
            engine.store().get("r-1").expect("get").sync_state,
            SyncState::Synced
        );
    }

    #[tokio::test]
    async fn manual_retry_resets_terminal_failure() {
        let remote = ScriptedRemote::default();
        remote.push(Err(RemoteError::Rejected {
            status: 400,
            body: "bad".into(),
        }));
        let (engine, _sink) = engine_with("manual-retry", remote, test_config());
        engine.store().put(&pending_report("r-1", 0)).expect("put");
        engine.run_cycle().await.expect("cycle");

        let requeued = engine.retry("r-1").await.expect("retry");
        assert_eq!(requeued.sync_state, SyncState::Pending);
        assert_eq!(requeued.attempt_count, 0);
        assert!(requeued.failure.is_none());

        engine.run_cycle().await.expect("cycle");
        assert_eq!(
            engine.store().get("r-1").expect("get").sync_state,
            SyncState::Synced
        );
        assert!(matches!(
            engine.retry("r-1").await,
            Err(ReportError::InvalidTransition {
                from: SyncState::Synced,
                ..
            })
        ));
    }
}
