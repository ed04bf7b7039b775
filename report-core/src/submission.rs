use crate::connectivity::ConnectivityWatch;
use crate::error::{ReportError, Result};
use crate::report::{now, IncidentType, Location, Report, ReportDraft, SyncState};
use crate::service::SyncHandle;
use crate::store::ReportStore;

/// Entry point the UI calls on "submit".
#[derive(Clone, Debug)]
pub struct ReportSubmitter {
    store: ReportStore,
    connectivity: ConnectivityWatch,
    sync: SyncHandle,
}

impl ReportSubmitter {
    pub fn new(store: ReportStore, connectivity: ConnectivityWatch, sync: SyncHandle) -> Self {
        Self {
            store,
            connectivity,
            sync,
        }
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Validates and persists `draft` as a new `pending` report. Returns as
    /// soon as the report is durable; the network is never awaited.
    pub fn submit(&self, draft: ReportDraft) -> Result<Report> {
        let report = build_report(draft)?;
        self.store.put(&report)?;
        tracing::info!(
            report_id = %report.id,
            incident_type = %report.incident_type,
            severity = report.severity.as_str(),
            "report saved locally"
        );

        if self.connectivity.is_online() && !self.sync.request_report(&report.id) {
            tracing::warn!(report_id = %report.id, "sync service is not running; report stays queued");
        }
        Ok(report)
    }
}

fn build_report(draft: ReportDraft) -> Result<Report> {
    let incident_type = draft
        .incident_type
        .parse::<IncidentType>()
        .map_err(ReportError::Validation)?;

    let description = draft.description.trim();
    if description.is_empty() {
        return Err(ReportError::validation("description is required"));
    }

    let mut media_refs = Vec::with_capacity(draft.media_refs.len());
    for media_ref in draft.media_refs {
        let media_ref = media_ref.trim();
        if media_ref.is_empty() {
            return Err(ReportError::validation("media references must not be empty"));
        }
        media_refs.push(media_ref.to_string());
    }

    let location = match draft.location {
        Some(Location::Text(text)) if text.trim().is_empty() => None,
        other => other,
    };

    Ok(Report {
        id: uuid::Uuid::new_v4().to_string(),
        incident_type,
        description: description.to_string(),
        severity: draft.severity,
        location,
        media_refs,
        created_at: now(),
        sync_state: SyncState::Pending,
        last_attempt_at: None,
        attempt_count: 0,
        failure: None,
    })
}
