use report_core::connectivity::{ConnectivityHandle, ConnectivityWatch};
use report_core::remote::HttpReportsRemote;
use report_core::service::{SyncHandle, SyncRequest};
use report_core::store::ReportStore;
use report_core::submission::ReportSubmitter;
use report_core::sync::SyncEngine;
use report_core::SyncConfig;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Clone)]
pub struct AppState {
    pub config: SyncConfig,
    pub store: ReportStore,
    pub submitter: ReportSubmitter,
    pub engine: SyncEngine<HttpReportsRemote>,
    pub remote: HttpReportsRemote,
    pub connectivity: ConnectivityHandle,
    pub sync: SyncHandle,
}

/// Receiving ends handed to the runtime exactly once.
pub struct RuntimeChannels {
    pub requests: UnboundedReceiver<SyncRequest>,
    pub connectivity: ConnectivityWatch,
}
