use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const SCHEMA_V1: &str = "report.v1";

pub const INCIDENT_TYPES: [&str; 7] = [
    "cyclone",
    "tsunami",
    "flood",
    "storm-surge",
    "wind",
    "rain",
    "other",
];

pub const SEVERITIES: [&str; 4] = ["low", "medium", "high", "critical"];

/// Wire form of a hazard report, as sent to `POST /api/reports`.
///
/// `id` doubles as the idempotency key: the server stores at most one record per id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportV1 {
    pub id: String,
    pub incident_type: String,
    pub description: String,
    pub severity: String,
    #[serde(default)]
    pub location: Option<serde_json::Value>,
    #[serde(default)]
    pub media_refs: Vec<String>,
    pub created_at: String,
}

/// A report as listed by `GET /api/reports`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoredReportV1 {
    #[serde(flatten)]
    pub report: ReportV1,
    pub status: String,
    pub received_at: String,
}

pub fn validate_report_v1(report: &ReportV1) -> Result<(), String> {
    if report.id.trim().is_empty() {
        return Err("id is required".into());
    }
    if report.id.chars().any(char::is_whitespace) {
        return Err(format!("id '{}' must not contain whitespace", report.id));
    }
    if !INCIDENT_TYPES.contains(&report.incident_type.as_str()) {
        return Err(format!("invalid incidentType '{}'", report.incident_type));
    }
    if report.description.trim().is_empty() {
        return Err("description is required".into());
    }
    if !SEVERITIES.contains(&report.severity.as_str()) {
        return Err(format!("invalid severity '{}'", report.severity));
    }
    if report.media_refs.iter().any(|r| r.trim().is_empty()) {
        return Err("mediaRefs must not contain empty references".into());
    }
    chrono::DateTime::parse_from_rfc3339(&report.created_at)
        .map_err(|e| format!("invalid createdAt '{}': {e}", report.created_at))?;
    Ok(())
}

pub fn report_v1_schema() -> serde_json::Value {
    let schema = schemars::schema_for!(ReportV1);
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({}))
}
