use crate::error::{ReportError, Result};
use crate::report::{
    format_timestamp, parse_timestamp, FailureKind, Report, ReportPatch, SyncFailure, SyncState,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const COLUMNS: &str = "id, incident_type, description, severity, location, media_refs, \
                       created_at, sync_state, last_attempt_at, attempt_count, \
                       failure_kind, failure_message";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: usize,
    pub syncing: usize,
    pub synced: usize,
    pub failed: usize,
}

/// Durable local report storage. Every mutation is committed before it returns.
#[derive(Clone, Debug)]
pub struct ReportStore {
    db_path: Arc<PathBuf>,
}

impl ReportStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self {
            db_path: Arc::new(db_path),
        };
        let conn = store.connect()?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS reports (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                incident_type TEXT NOT NULL,
                description TEXT NOT NULL,
                severity TEXT NOT NULL,
                location TEXT,
                media_refs TEXT NOT NULL,
                created_at TEXT NOT NULL,
                sync_state TEXT NOT NULL,
                last_attempt_at TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                failure_kind TEXT,
                failure_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_reports_state ON reports(sync_state, created_at, seq);
            ",
        )?;
        tracing::debug!(path = %store.db_path.display(), "report store opened");

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&*self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Ok(conn)
    }

    pub fn put(&self, report: &Report) -> Result<()> {
        let conn = self.connect()?;
        let location = report
            .location
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let media_refs = serde_json::to_string(&report.media_refs)?;
        let (failure_kind, failure_message) = failure_columns(report.failure.as_ref());

        let inserted = conn.execute(
            "INSERT INTO reports (id, incident_type, description, severity, location, media_refs,
                                  created_at, sync_state, last_attempt_at, attempt_count,
                                  failure_kind, failure_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO NOTHING",
            params![
                report.id,
                report.incident_type.as_str(),
                report.description,
                report.severity.as_str(),
                location,
                media_refs,
                format_timestamp(&report.created_at),
                report.sync_state.as_str(),
                report.last_attempt_at.as_ref().map(format_timestamp),
                report.attempt_count,
                failure_kind,
                failure_message,
            ],
        )?;

        if inserted == 0 {
            return Err(ReportError::DuplicateId(report.id.clone()));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Report> {
        let conn = self.connect()?;
        find(&conn, id)?.ok_or_else(|| ReportError::NotFound(id.to_string()))
    }

    /// Reports in `state`, oldest first.
    pub fn list_by_state(&self, state: SyncState) -> Result<Vec<Report>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM reports
             WHERE sync_state = ?1
             ORDER BY created_at ASC, seq ASC"
        ))?;
        let rows = stmt.query_map(params![state.as_str()], map_row)?;

        let mut reports = Vec::new();
        for row in rows {
            reports.push(row?);
        }
        Ok(reports)
    }

    /// Every report, newest first.
    pub fn list_all(&self) -> Result<Vec<Report>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM reports
             ORDER BY created_at DESC, seq DESC"
        ))?;
        let rows = stmt.query_map([], map_row)?;

        let mut reports = Vec::new();
        for row in rows {
            reports.push(row?);
        }
        Ok(reports)
    }

    pub fn count_by_state(&self) -> Result<StateCounts> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT sync_state, COUNT(*) FROM reports GROUP BY sync_state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StateCounts::default();
        for row in rows {
            let (state, count) = row?;
            let count = usize::try_from(count).unwrap_or(0);
            match state.parse::<SyncState>() {
                Ok(SyncState::Pending) => counts.pending = count,
                Ok(SyncState::Syncing) => counts.syncing = count,
                Ok(SyncState::Synced) => counts.synced = count,
                Ok(SyncState::Failed) => counts.failed = count,
                Err(err) => tracing::warn!(%err, "skipping unknown sync state in counts"),
            }
        }
        Ok(counts)
    }

    /// Applies `patch` inside one write transaction, checking the sync state
    /// machine against the row as it is at commit time.
    pub fn update(&self, id: &str, patch: ReportPatch) -> Result<Report> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut report = find(&tx, id)?.ok_or_else(|| ReportError::NotFound(id.to_string()))?;
        if patch.is_empty() {
            return Ok(report);
        }

        let from = report.sync_state;
        if from == SyncState::Synced {
            return Err(ReportError::InvalidTransition {
                id: id.to_string(),
                from,
                to: patch.sync_state.unwrap_or(from),
            });
        }
        if let Some(to) = patch.sync_state {
            if !from.can_transition_to(to) {
                return Err(ReportError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    to,
                });
            }
            report.sync_state = to;
        }
        if let Some(at) = patch.last_attempt_at {
            report.last_attempt_at = Some(at);
        }
        if let Some(count) = patch.attempt_count {
            report.attempt_count = count;
        }
        if let Some(failure) = patch.failure {
            report.failure = failure;
        }

        let (failure_kind, failure_message) = failure_columns(report.failure.as_ref());
        tx.execute(
            "UPDATE reports
             SET sync_state = ?2, last_attempt_at = ?3, attempt_count = ?4,
                 failure_kind = ?5, failure_message = ?6
             WHERE id = ?1",
            params![
                id,
                report.sync_state.as_str(),
                report.last_attempt_at.as_ref().map(format_timestamp),
                report.attempt_count,
                failure_kind,
                failure_message,
            ],
        )?;
        tx.commit()?;

        Ok(report)
    }
}

fn find(conn: &Connection, id: &str) -> Result<Option<Report>> {
    let report = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM reports WHERE id = ?1"),
            params![id],
            map_row,
        )
        .optional()?;
    Ok(report)
}

fn failure_columns(failure: Option<&SyncFailure>) -> (Option<&'static str>, Option<String>) {
    match failure {
        Some(f) => (Some(f.kind.as_str()), Some(f.message.clone())),
        None => (None, None),
    }
}

fn conversion_error(
    column: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, err.into())
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Report> {
    let incident_type: String = row.get(1)?;
    let severity: String = row.get(3)?;
    let location: Option<String> = row.get(4)?;
    let media_refs: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let sync_state: String = row.get(7)?;
    let last_attempt_at: Option<String> = row.get(8)?;
    let failure_kind: Option<String> = row.get(10)?;
    let failure_message: Option<String> = row.get(11)?;

    let location = location
        .map(|s| serde_json::from_str(&s).map_err(|err| conversion_error(4, err)))
        .transpose()?;
    let media_refs = serde_json::from_str(&media_refs).map_err(|err| conversion_error(5, err))?;
    let last_attempt_at = last_attempt_at
        .map(|s| parse_timestamp(&s).map_err(|err| conversion_error(8, err)))
        .transpose()?;
    let failure = match failure_kind {
        Some(kind) => Some(SyncFailure {
            kind: kind
                .parse::<FailureKind>()
                .map_err(|err| conversion_error(10, err))?,
            message: failure_message.unwrap_or_default(),
        }),
        None => None,
    };

    Ok(Report {
        id: row.get(0)?,
        incident_type: incident_type
            .parse()
            .map_err(|err: String| conversion_error(1, err))?,
        description: row.get(2)?,
        severity: severity
            .parse()
            .map_err(|err: String| conversion_error(3, err))?,
        location,
        media_refs,
        created_at: parse_timestamp(&created_at).map_err(|err| conversion_error(6, err))?,
        sync_state: sync_state
            .parse()
            .map_err(|err: String| conversion_error(7, err))?,
        last_attempt_at,
        attempt_count: row.get(9)?,
        failure,
    })
}
