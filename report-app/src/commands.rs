use crate::state::AppState;
use report_core::report::format_timestamp;
use report_core::{Location, Report, ReportDraft, Severity, SyncState};
use report_registry::StoredReportV1;
use serde::{Deserialize, Serialize};

pub const SUBMITTED_ONLINE_MESSAGE: &str =
    "Your report has been submitted successfully and is being reviewed.";
pub const SAVED_OFFLINE_MESSAGE: &str =
    "Your report has been saved locally and will be synced when you have internet connection.";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportDto {
    pub id: String,
    pub incident_type: String,
    pub incident_label: String,
    pub description: String,
    pub severity: String,
    pub location: Option<Location>,
    pub media_refs: Vec<String>,
    pub created_at: String,
    pub sync_state: String,
    pub status_label: String,
    pub attempt_count: u32,
    pub last_attempt_at: Option<String>,
    pub failure_message: Option<String>,
    pub can_retry: bool,
}

impl From<&Report> for ReportDto {
    fn from(report: &Report) -> Self {
        Self {
            id: report.id.clone(),
            incident_type: report.incident_type.as_str().to_string(),
            incident_label: report.incident_type.display_name().to_string(),
            description: report.description.clone(),
            severity: report.severity.as_str().to_string(),
            location: report.location.clone(),
            media_refs: report.media_refs.clone(),
            created_at: format_timestamp(&report.created_at),
            sync_state: report.sync_state.as_str().to_string(),
            status_label: status_label(report).to_string(),
            attempt_count: report.attempt_count,
            last_attempt_at: report.last_attempt_at.as_ref().map(format_timestamp),
            failure_message: report.failure.as_ref().map(|f| f.message.clone()),
            can_retry: report.sync_state == SyncState::Failed,
        }
    }
}

fn status_label(report: &Report) -> &'static str {
    match report.sync_state {
        SyncState::Pending => "Pending Sync",
        SyncState::Syncing => "Syncing",
        SyncState::Synced => "Synced",
        SyncState::Failed if report.needs_correction() => "Needs Correction",
        SyncState::Failed => "Failed",
    }
}

/// Form payload from the report screen.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubmitReportRequest {
    pub incident_type: String,
    pub description: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub media_refs: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitOutcomeDto {
    pub report: ReportDto,
    pub online: bool,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DashboardDto {
    pub online: bool,
    pub pending: usize,
    pub syncing: usize,
    pub synced: usize,
    pub failed: usize,
}

pub fn submit_report(
    state: &AppState,
    request: SubmitReportRequest,
) -> Result<SubmitOutcomeDto, String> {
    let severity = match request.severity.as_deref().map(str::trim) {
        None | Some("") => Severity::default(),
        Some(value) => value.parse::<Severity>()?,
    };
    let draft = ReportDraft {
        incident_type: request.incident_type,
        description: request.description,
        severity,
        location: request.location,
        media_refs: request.media_refs,
    };

    let online = state.submitter.is_online();
    let report = state.submitter.submit(draft).map_err(|e| e.to_string())?;
    let message = if online {
        SUBMITTED_ONLINE_MESSAGE
    } else {
        SAVED_OFFLINE_MESSAGE
    };

    Ok(SubmitOutcomeDto {
        report: ReportDto::from(&report),
        online,
        message: message.to_string(),
    })
}

pub fn list_reports(state: &AppState) -> Result<Vec<ReportDto>, String> {
    let reports = state.store.list_all().map_err(|e| e.to_string())?;
    Ok(reports.iter().map(ReportDto::from).collect())
}

pub fn get_report(state: &AppState, report_id: String) -> Result<ReportDto, String> {
    state
        .store
        .get(&report_id)
        .map(|r| ReportDto::from(&r))
        .map_err(|e| e.to_string())
}

pub fn dashboard(state: &AppState) -> Result<DashboardDto, String> {
    let counts = state.store.count_by_state().map_err(|e| e.to_string())?;
    Ok(DashboardDto {
        online: state.connectivity.is_online(),
        pending: counts.pending,
        syncing: counts.syncing,
        synced: counts.synced,
        failed: counts.failed,
    })
}

/// Requeues a failed report and asks the sync service for a cycle.
pub async fn retry_report(state: &AppState, report_id: String) -> Result<ReportDto, String> {
    let report = state
        .engine
        .retry(&report_id)
        .await
        .map_err(|e| e.to_string())?;
    request_sync(state);
    Ok(ReportDto::from(&report))
}

/// Manual "sync now". Returns whether a cycle was requested.
pub fn sync_now(state: &AppState) -> bool {
    request_sync(state)
}

fn request_sync(state: &AppState) -> bool {
    if !state.connectivity.is_online() {
        tracing::debug!("offline; sync request deferred until connectivity returns");
        return false;
    }
    state.sync.request_cycle()
}

/// Reports as the server holds them, for the community feed.
pub async fn fetch_remote_reports(state: &AppState) -> Result<Vec<StoredReportV1>, String> {
    state.remote.list_reports().await.map_err(|e| e.to_string())
}
