use crate::report::Report;

pub const REPORT_SYNCING: &str = "report-syncing";
pub const REPORT_SYNCED: &str = "report-synced";
pub const REPORT_FAILED: &str = "report-failed";
pub const REPORT_NEEDS_CORRECTION: &str = "report-needs-correction";
pub const REPORT_RETRIES_EXHAUSTED: &str = "report-retries-exhausted";
pub const SYNC_CYCLE_COMPLETED: &str = "sync-cycle-completed";

/// Where sync progress is published for the presentation layer.
pub trait EventSink: Send + Sync + 'static {
    fn emit_json(&self, event: &str, payload: serde_json::Value);
}

pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit_json(&self, _event: &str, _payload: serde_json::Value) {}
}

pub(crate) fn report_payload(report: &Report) -> serde_json::Value {
    serde_json::json!({
        "id": report.id,
        "sync_state": report.sync_state,
        "attempt_count": report.attempt_count,
        "failure": report.failure,
    })
}
