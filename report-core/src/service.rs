use crate::connectivity::ConnectivityWatch;
use crate::remote::ReportsRemote;
use crate::sync::SyncEngine;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tokio::time::Instant;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncRequest {
    /// Opportunistic attempt for a freshly submitted report.
    Report(String),
    Cycle,
}

#[derive(Clone, Debug)]
pub struct SyncHandle {
    tx: UnboundedSender<SyncRequest>,
}

impl SyncHandle {
    /// Returns false once the sync service has shut down.
    pub fn request_report(&self, id: &str) -> bool {
        self.tx.send(SyncRequest::Report(id.to_string())).is_ok()
    }

    pub fn request_cycle(&self) -> bool {
        self.tx.send(SyncRequest::Cycle).is_ok()
    }
}

pub fn sync_channel() -> (SyncHandle, UnboundedReceiver<SyncRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SyncHandle { tx }, rx)
}

/// The sync service loop: reacts to connectivity transitions, submission
/// requests and retry deadlines until every [`SyncHandle`] is dropped, then
/// waits for in-flight attempts to finish.
pub async fn run_sync_service<R: ReportsRemote>(
    engine: SyncEngine<R>,
    mut connectivity: ConnectivityWatch,
    mut requests: UnboundedReceiver<SyncRequest>,
) {
    match engine.recover_interrupted().await {
        Ok(0) => {}
        Ok(n) => tracing::info!(recovered = n, "requeued interrupted sync attempts"),
        Err(err) => tracing::error!(%err, "failed to recover interrupted sync attempts"),
    }

    let mut tasks: JoinSet<Option<Duration>> = JoinSet::new();
    let mut retry_at: Option<Instant> = None;
    let mut connectivity_open = true;

    if connectivity.is_online() {
        spawn_cycle(&mut tasks, &engine);
    }

    loop {
        tokio::select! {
            change = connectivity.next_change(), if connectivity_open => match change {
                Some(true) => {
                    tracing::info!("connectivity restored; starting sync cycle");
                    spawn_cycle(&mut tasks, &engine);
                }
                Some(false) => tracing::info!("connectivity lost; reports will queue locally"),
                None => connectivity_open = false,
            },
            request = requests.recv() => match request {
                Some(SyncRequest::Report(id)) if connectivity.is_online() => {
                    spawn_attempt(&mut tasks, &engine, id);
                }
                Some(SyncRequest::Cycle) if connectivity.is_online() => {
                    spawn_cycle(&mut tasks, &engine);
                }
                Some(request) => tracing::debug!(?request, "offline; sync request deferred"),
                None => break,
            },
            _ = sleep_until_retry(retry_at), if retry_at.is_some() => {
                retry_at = None;
                if connectivity.is_online() {
                    tracing::debug!("retry backoff elapsed; starting sync cycle");
                    spawn_cycle(&mut tasks, &engine);
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                Ok(Some(delay)) => {
                    let at = Instant::now() + delay;
                    retry_at = Some(retry_at.map_or(at, |current| current.min(at)));
                }
                Ok(None) => {}
                Err(err) => tracing::error!(%err, "sync task failed"),
            },
        }
    }

    tracing::info!(in_flight = tasks.len(), "sync service stopping");
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            tracing::error!(%err, "sync task failed during shutdown");
        }
    }
}

async fn sleep_until_retry(at: Option<Instant>) {
    if let Some(at) = at {
        tokio::time::sleep_until(at).await;
    }
}

fn spawn_cycle<R: ReportsRemote>(tasks: &mut JoinSet<Option<Duration>>, engine: &SyncEngine<R>) {
    let engine = engine.clone();
    tasks.spawn(async move {
        match engine.run_cycle().await {
            Ok(Some(_)) | Ok(None) => {}
            Err(err) => tracing::error!(%err, "sync cycle failed"),
        }
        next_retry(&engine).await
    });
}

fn spawn_attempt<R: ReportsRemote>(
    tasks: &mut JoinSet<Option<Duration>>,
    engine: &SyncEngine<R>,
    id: String,
) {
    let engine = engine.clone();
    tasks.spawn(async move {
        if let Err(err) = engine.sync_report(&id).await {
            tracing::error!(report_id = %id, %err, "opportunistic sync failed");
        }
        next_retry(&engine).await
    });
}

async fn next_retry<R: ReportsRemote>(engine: &SyncEngine<R>) -> Option<Duration> {
    match engine.next_retry_delay().await {
        Ok(delay) => delay,
        Err(err) => {
            tracing::error!(%err, "could not compute next retry");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::connectivity::connectivity_channel;
    use crate::remote::RemoteError;
    use crate::report::{ReportDraft, Severity, SyncState};
    use crate::store::tests::db_path;
    use crate::store::ReportStore;
    use crate::submission::ReportSubmitter;
    use crate::testing::{CaptureSink, ScriptedRemote};

    fn config() -> SyncConfig {
        SyncConfig {
            max_attempts: 3,
            max_in_flight: 2,
            request_timeout: Duration::from_millis(200),
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(40),
            ..SyncConfig::default()
        }
    }

    fn cyclone_draft() -> ReportDraft {
        ReportDraft {
            incident_type: "cyclone".into(),
            description: "Storm approaching".into(),
            severity: Severity::Critical,
            ..ReportDraft::default()
        }
    }

    async fn wait_for_state(store: &ReportStore, id: &str, wanted: SyncState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if store.get(id).expect("get").sync_state == wanted {
                return;
            }
            assert!(Instant::now() < deadline, "report {id} never reached {wanted}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn offline_submission_syncs_when_connectivity_returns() {
        let store = ReportStore::open(db_path("service-offline")).expect("open");
        let remote = ScriptedRemote::default();
        let sink = CaptureSink::default();
        let engine = SyncEngine::with_sink(store.clone(), remote.clone(), config(), sink.clone());
        let (online, watch) = connectivity_channel(false);
        let (handle, requests) = sync_channel();
        let service = tokio::spawn(run_sync_service(engine, watch.clone(), requests));

        let submitter = ReportSubmitter::new(store.clone(), watch, handle);
        let report = submitter.submit(cyclone_draft()).expect("submit");
        assert_eq!(report.sync_state, SyncState::Pending);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(remote.calls().is_empty());
        assert_eq!(store.get(&report.id).expect("get").sync_state, SyncState::Pending);

        online.set_online(true);
        wait_for_state(&store, &report.id, SyncState::Synced).await;
        assert_eq!(
            sink.events_for(&report.id),
            vec!["report-syncing".to_string(), "report-synced".to_string()]
        );

        drop(submitter);
        service.await.expect("service stops");
        assert_eq!(remote.calls(), vec![report.id.clone()]);
    }

    #[tokio::test]
    async fn startup_cycle_syncs_reports_queued_before_launch() {
        let store = ReportStore::open(db_path("service-startup")).expect("open");
        store
            .put(&crate::store::tests::pending_report("queued", 30))
            .expect("put");
        let remote = ScriptedRemote::default();
        let engine = SyncEngine::new(store.clone(), remote.clone(), config());
        let (_online, watch) = connectivity_channel(true);
        let (handle, requests) = sync_channel();
        let service = tokio::spawn(run_sync_service(engine, watch, requests));

        wait_for_state(&store, "queued", SyncState::Synced).await;
        assert_eq!(remote.calls(), vec!["queued".to_string()]);

        drop(handle);
        service.await.expect("service stops");
    }

    #[tokio::test]
    async fn submission_burst_respects_concurrency_limit() {
        let store = ReportStore::open(db_path("service-burst")).expect("open");
        let remote = ScriptedRemote::default().with_delay(Duration::from_millis(30));
        let engine = SyncEngine::new(store.clone(), remote.clone(), config());
        let (_online, watch) = connectivity_channel(true);
        let (handle, requests) = sync_channel();
        let service = tokio::spawn(run_sync_service(engine, watch.clone(), requests));

        let submitter = ReportSubmitter::new(store.clone(), watch, handle);
        let mut ids = Vec::new();
        for n in 0..10 {
            let draft = ReportDraft {
                description: format!("report {n}"),
                ..cyclone_draft()
            };
            ids.push(submitter.submit(draft).expect("submit").id);
        }

        for id in &ids {
            wait_for_state(&store, id, SyncState::Synced).await;
        }
        assert_eq!(remote.calls().len(), 10);
        assert!(remote.max_concurrent() <= 2, "saw {}", remote.max_concurrent());

        drop(submitter);
        service.await.expect("service stops");
    }

    #[tokio::test]
    async fn online_submission_gives_up_after_three_timeouts() {
        let store = ReportStore::open(db_path("service-timeouts")).expect("open");
        let remote = ScriptedRemote::always(Err(RemoteError::Timeout));
        let engine = SyncEngine::new(store.clone(), remote.clone(), config());
        let (_online, watch) = connectivity_channel(true);
        let (handle, requests) = sync_channel();
        let service = tokio::spawn(run_sync_service(engine, watch.clone(), requests));

        let submitter = ReportSubmitter::new(store.clone(), watch, handle);
        let report = submitter.submit(cyclone_draft()).expect("submit");

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.get(&report.id).expect("get").attempt_count < 3 {
            assert!(Instant::now() < deadline, "retries never exhausted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let failed = store.get(&report.id).expect("get");
        assert_eq!(failed.sync_state, SyncState::Failed);
        assert!(failed.is_terminal_failure(3));
        assert_eq!(remote.calls().len(), 3);

        drop(submitter);
        service.await.expect("service stops");
    }

    #[tokio::test]
    async fn repeated_restores_drive_every_report_to_a_final_state() {
        let store = ReportStore::open(db_path("service-flap")).expect("open");
        let remote = ScriptedRemote::default();
        remote.push(Err(RemoteError::Server { status: 502 }));
        remote.push(Err(RemoteError::Rejected {
            status: 400,
            body: "bad".into(),
        }));
        let engine = SyncEngine::new(store.clone(), remote.clone(), config());
        let (online, watch) = connectivity_channel(false);
        let (handle, requests) = sync_channel();
        let service = tokio::spawn(run_sync_service(engine, watch.clone(), requests));

        let submitter = ReportSubmitter::new(store.clone(), watch, handle);
        let mut ids = Vec::new();
        for n in 0..4 {
            let draft = ReportDraft {
                description: format!("report {n}"),
                ..cyclone_draft()
            };
            ids.push(submitter.submit(draft).expect("submit").id);
        }

        for _ in 0..5 {
            online.set_online(true);
            tokio::time::sleep(Duration::from_millis(60)).await;
            online.set_online(false);
        }
        online.set_online(true);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let reports: Vec<_> = ids.iter().map(|id| store.get(id).expect("get")).collect();
            let settled = reports
                .iter()
                .all(|r| r.sync_state == SyncState::Synced || r.is_terminal_failure(3));
            if settled {
                assert!(reports.iter().all(|r| r.attempt_count <= 3));
                break;
            }
            assert!(Instant::now() < deadline, "reports never settled");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(submitter);
        service.await.expect("service stops");
    }
}
