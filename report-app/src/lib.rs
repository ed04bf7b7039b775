pub mod commands;
pub mod runtime;
pub mod state;

use crate::commands::SubmitReportRequest;
use crate::state::{AppState, RuntimeChannels};
use report_core::connectivity::connectivity_channel;
use report_core::remote::HttpReportsRemote;
use report_core::service::sync_channel;
use report_core::store::ReportStore;
use report_core::submission::ReportSubmitter;
use report_core::sync::SyncEngine;
use report_core::{Location, SyncConfig};

pub const DEFAULT_LOG_FILTER: &str = "report_core=info,report_server=info,report_app=info";

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Wires store, engine and submitter. The app starts offline until the
/// runtime probe says otherwise.
pub fn build_state(config: SyncConfig) -> Result<(AppState, RuntimeChannels), String> {
    let store = ReportStore::open(&config.db_path).map_err(|e| e.to_string())?;
    let remote = HttpReportsRemote::new(config.api_url.clone(), config.request_timeout)
        .map_err(|e| e.to_string())?;
    let engine = SyncEngine::with_sink(
        store.clone(),
        remote.clone(),
        config.clone(),
        runtime::TracingSink,
    );

    let (connectivity, watch) = connectivity_channel(false);
    let (sync, requests) = sync_channel();
    let submitter = ReportSubmitter::new(store.clone(), watch.clone(), sync.clone());

    Ok((
        AppState {
            config,
            store,
            submitter,
            engine,
            remote,
            connectivity,
            sync,
        },
        RuntimeChannels {
            requests,
            connectivity: watch,
        },
    ))
}

pub async fn run(config: SyncConfig) -> Result<(), String> {
    let (state, channels) = build_state(config)?;
    let tasks = runtime::start(&state, channels);

    let counts = commands::dashboard(&state)?;
    tracing::info!(
        db_path = %state.config.db_path,
        api_url = %state.config.api_url,
        pending = counts.pending,
        failed = counts.failed,
        "report app running"
    );

    tokio::signal::ctrl_c().await.map_err(|e| e.to_string())?;
    tracing::info!("shutting down");

    if let Some(probe) = tasks.probe {
        probe.abort();
    }
    drop(state);
    tasks.sync_service.await.map_err(|e| e.to_string())
}

/// Seeds a few reports without touching the network and prints the local view.
pub async fn run_demo(config: SyncConfig) -> Result<(), String> {
    let (state, channels) = build_state(config)?;
    let tasks = runtime::start(&state, channels);
    if let Some(probe) = &tasks.probe {
        probe.abort();
    }

    for request in demo_requests() {
        let outcome = commands::submit_report(&state, request)?;
        println!("{}", outcome.message);
    }

    let reports = commands::list_reports(&state)?;
    println!(
        "reports:\n{}",
        serde_json::to_string_pretty(&reports).map_err(|e| e.to_string())?
    );

    let counts = commands::dashboard(&state)?;
    println!(
        "dashboard:\n{}",
        serde_json::to_string_pretty(&counts).map_err(|e| e.to_string())?
    );

    drop(state);
    tasks.sync_service.await.map_err(|e| e.to_string())
}

fn demo_requests() -> Vec<SubmitReportRequest> {
    vec![
        SubmitReportRequest {
            incident_type: "Cyclone Warning".into(),
            description: "Strong winds and rough sea near the fishing harbour".into(),
            severity: Some("critical".into()),
            location: Some(Location::Coordinates {
                latitude: 8.5241,
                longitude: 76.9366,
            }),
            media_refs: vec!["photo-harbour-1".into()],
        },
        SubmitReportRequest {
            incident_type: "storm-surge".into(),
            description: "Water crossing the sea wall at high tide".into(),
            severity: Some("high".into()),
            location: Some(Location::Text("Marina Beach, Chennai".into())),
            media_refs: vec![],
        },
        SubmitReportRequest {
            incident_type: "Heavy Rain".into(),
            description: "Continuous rain since the morning, drains overflowing".into(),
            severity: None,
            location: None,
            media_refs: vec![],
        },
    ]
}
