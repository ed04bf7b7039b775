use crate::state::{AppState, RuntimeChannels};
use report_core::connectivity::ConnectivityHandle;
use report_core::events::EventSink;
use report_core::service::run_sync_service;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Publishes sync events to the log; the UI shell subscribes through its own sink.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit_json(&self, event: &str, payload: serde_json::Value) {
        tracing::info!(event, %payload, "sync event");
    }
}

pub struct RuntimeTasks {
    pub sync_service: JoinHandle<()>,
    pub probe: Option<JoinHandle<()>>,
}

/// Starts the sync service and, when the API address resolves, the
/// connectivity probe. Must run inside a tokio runtime.
pub fn start(state: &AppState, channels: RuntimeChannels) -> RuntimeTasks {
    let sync_service = tokio::spawn(run_sync_service(
        state.engine.clone(),
        channels.connectivity,
        channels.requests,
    ));

    let probe = match probe_target(&state.config.api_url) {
        Some(target) => Some(tokio::spawn(probe_connectivity(
            state.connectivity.clone(),
            target,
            state.config.probe_interval,
            state.config.request_timeout,
        ))),
        None => {
            tracing::warn!(api_url = %state.config.api_url, "cannot probe api address; staying offline");
            None
        }
    };

    RuntimeTasks {
        sync_service,
        probe,
    }
}

/// `host:port` of the reports API, used as the reachability target.
pub fn probe_target(api_url: &str) -> Option<String> {
    let url = reqwest::Url::parse(api_url).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

/// Marks the app online while a TCP connection to `target` succeeds.
pub async fn probe_connectivity(
    connectivity: ConnectivityHandle,
    target: String,
    interval: Duration,
    timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let reachable = matches!(
            tokio::time::timeout(timeout, TcpStream::connect(&target)).await,
            Ok(Ok(_))
        );
        if connectivity.set_online(reachable) {
            tracing::info!(online = reachable, %target, "connectivity changed");
        }
    }
}
