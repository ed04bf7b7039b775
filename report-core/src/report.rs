use chrono::{DateTime, SecondsFormat, Utc};
use report_registry::ReportV1;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IncidentType {
    Cyclone,
    Tsunami,
    Flood,
    StormSurge,
    Wind,
    Rain,
    Other,
}

impl IncidentType {
    pub const ALL: [IncidentType; 7] = [
        IncidentType::Cyclone,
        IncidentType::Tsunami,
        IncidentType::Flood,
        IncidentType::StormSurge,
        IncidentType::Wind,
        IncidentType::Rain,
        IncidentType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentType::Cyclone => "cyclone",
            IncidentType::Tsunami => "tsunami",
            IncidentType::Flood => "flood",
            IncidentType::StormSurge => "storm-surge",
            IncidentType::Wind => "wind",
            IncidentType::Rain => "rain",
            IncidentType::Other => "other",
        }
    }

    /// Label shown by the report form.
    pub fn display_name(&self) -> &'static str {
        match self {
            IncidentType::Cyclone => "Cyclone Warning",
            IncidentType::Tsunami => "Tsunami Alert",
            IncidentType::Flood => "Flood Warning",
            IncidentType::StormSurge => "Storm Surge",
            IncidentType::Wind => "High Winds",
            IncidentType::Rain => "Heavy Rain",
            IncidentType::Other => "Other",
        }
    }
}

impl FromStr for IncidentType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase().replace(['_', ' '], "-");
        if let Some(found) = Self::ALL.iter().find(|t| t.as_str() == normalized) {
            return Ok(*found);
        }
        Self::ALL
            .iter()
            .find(|t| t.display_name().eq_ignore_ascii_case(value.trim()))
            .copied()
            .ok_or_else(|| format!("unknown incident type '{value}'"))
    }
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// Where the hazard was observed. Opaque to the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Location {
    Coordinates { latitude: f64, longitude: f64 },
    Text(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
        }
    }

    /// Edges of the per-report sync state machine. Self-loops are not edges,
    /// so a second claim on a `syncing` report is refused.
    pub fn can_transition_to(&self, next: SyncState) -> bool {
        matches!(
            (self, next),
            (SyncState::Pending, SyncState::Syncing)
                | (SyncState::Syncing, SyncState::Synced)
                | (SyncState::Syncing, SyncState::Failed)
                | (SyncState::Failed, SyncState::Pending)
        )
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(SyncState::Pending),
            "syncing" => Ok(SyncState::Syncing),
            "synced" => Ok(SyncState::Synced),
            "failed" => Ok(SyncState::Failed),
            other => Err(format!("unknown sync state '{other}'")),
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Transport error, timeout or 5xx; requeued with backoff.
    Retryable,
    /// 4xx from the remote; the user has to correct the report.
    Rejected,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Retryable => "retryable",
            FailureKind::Rejected => "rejected",
        }
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "retryable" => Ok(FailureKind::Retryable),
            "rejected" => Ok(FailureKind::Rejected),
            other => Err(format!("unknown failure kind '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub incident_type: IncidentType,
    pub description: String,
    pub severity: Severity,
    pub location: Option<Location>,
    pub media_refs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub sync_state: SyncState,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub failure: Option<SyncFailure>,
}

impl Report {
    pub fn needs_correction(&self) -> bool {
        self.sync_state == SyncState::Failed
            && self
                .failure
                .as_ref()
                .is_some_and(|f| f.kind == FailureKind::Rejected)
    }

    /// Failed and out of automatic retries; only a manual retry moves it again.
    pub fn is_terminal_failure(&self, max_attempts: u32) -> bool {
        self.sync_state == SyncState::Failed
            && (self.needs_correction() || self.attempt_count >= max_attempts)
    }

    pub fn to_wire(&self) -> Result<ReportV1, serde_json::Error> {
        Ok(ReportV1 {
            id: self.id.clone(),
            incident_type: self.incident_type.as_str().to_string(),
            description: self.description.clone(),
            severity: self.severity.as_str().to_string(),
            location: self.location.as_ref().map(serde_json::to_value).transpose()?,
            media_refs: self.media_refs.clone(),
            created_at: format_timestamp(&self.created_at),
        })
    }
}

/// What the UI hands to `submit`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReportDraft {
    pub incident_type: String,
    pub description: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub media_refs: Vec<String>,
}

/// Partial update accepted by `ReportStore::update`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReportPatch {
    pub sync_state: Option<SyncState>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempt_count: Option<u32>,
    /// `Some(None)` clears the recorded failure.
    pub failure: Option<Option<SyncFailure>>,
}

impl ReportPatch {
    pub fn state(sync_state: SyncState) -> Self {
        Self {
            sync_state: Some(sync_state),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Current time truncated to microseconds, the precision timestamps are stored at.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incident_type_accepts_canonical_and_form_names() {
        assert_eq!("cyclone".parse::<IncidentType>(), Ok(IncidentType::Cyclone));
        assert_eq!("storm_surge".parse::<IncidentType>(), Ok(IncidentType::StormSurge));
        assert_eq!("Storm Surge".parse::<IncidentType>(), Ok(IncidentType::StormSurge));
        assert_eq!("High Winds".parse::<IncidentType>(), Ok(IncidentType::Wind));
        assert_eq!("tsunami alert".parse::<IncidentType>(), Ok(IncidentType::Tsunami));
        assert!("earthquake".parse::<IncidentType>().is_err());
    }

    #[test]
    fn severity_is_ordered() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::default(), Severity::Medium);
    }

    #[test]
    fn state_machine_edges() {
        use SyncState::*;
        assert!(Pending.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Synced));
        assert!(Syncing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Syncing.can_transition_to(Syncing));
        assert!(!Pending.can_transition_to(Synced));
        assert!(!Failed.can_transition_to(Syncing));
        for next in [Pending, Syncing, Failed, Synced] {
            assert!(!Synced.can_transition_to(next));
        }
    }

    #[test]
    fn location_serializes_untagged() {
        let coords = Location::Coordinates {
            latitude: 12.9716,
            longitude: 77.5946,
        };
        assert_eq!(
            serde_json::to_value(&coords).expect("json"),
            serde_json::json!({"latitude": 12.9716, "longitude": 77.5946})
        );
        let text: Location = serde_json::from_str("\"Marina Beach\"").expect("text");
        assert_eq!(text, Location::Text("Marina Beach".into()));
    }

    #[test]
    fn now_survives_timestamp_formatting() {
        let ts = now();
        assert_eq!(parse_timestamp(&format_timestamp(&ts)).expect("parse"), ts);
    }
}
