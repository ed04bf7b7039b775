use report_registry::{ReportV1, StoredReportV1};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const RECEIVED_STATUS: &str = "under_review";

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Created,
    AlreadyExists,
}

/// Server-side reports table. Inserts are idempotent on report id.
#[derive(Clone, Debug)]
pub struct ReportTable {
    db_path: Arc<PathBuf>,
}

impl ReportTable {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let table = Self {
            db_path: Arc::new(db_path),
        };
        let conn = table.connect()?;
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
                created_at_utc TEXT NOT NULL,
                status TEXT NOT NULL,
                received_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reports_created ON reports(created_at_utc, seq);
            ",
        )?;
        Ok(table)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&*self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn insert(&self, report: &ReportV1) -> Result<InsertOutcome> {
        let conn = self.connect()?;
        let location = report
            .location
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let media_refs = serde_json::to_string(&report.media_refs)?;
        let created_at_utc = utc_sort_key(&report.created_at)?;

        let inserted = conn.execute(
            "INSERT INTO reports (id, incident_type, description, severity, location,
                                  media_refs, created_at, created_at_utc, status, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO NOTHING",
            params![
                report.id,
                report.incident_type,
                report.description,
                report.severity,
                location,
                media_refs,
                report.created_at,
                created_at_utc,
                RECEIVED_STATUS,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(if inserted == 0 {
            InsertOutcome::AlreadyExists
        } else {
            InsertOutcome::Created
        })
    }

    pub fn list(&self) -> Result<Vec<StoredReportV1>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, incident_type, description, severity, location, media_refs,
                    created_at, status, received_at
             FROM reports
             ORDER BY created_at_utc ASC, seq ASC",
        )?;
        let rows = stmt.query_map([], map_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Fixed-width UTC form of `createdAt`, so text order matches time order
/// whatever offset the client sent.
fn utc_sort_key(created_at: &str) -> Result<String> {
    let ts = chrono::DateTime::parse_from_rfc3339(created_at)?;
    Ok(ts
        .with_timezone(&chrono::Utc)
        .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredReportV1> {
    let location: Option<String> = row.get(4)?;
    let media_refs: String = row.get(5)?;

    let location = location
        .map(|s| {
            serde_json::from_str(&s).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(err))
            })
        })
        .transpose()?;
    let media_refs = serde_json::from_str(&media_refs).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(err))
    })?;

    Ok(StoredReportV1 {
        report: ReportV1 {
            id: row.get(0)?,
            incident_type: row.get(1)?,
            description: row.get(2)?,
            severity: row.get(3)?,
            location,
            media_refs,
            created_at: row.get(6)?,
        },
        status: row.get(7)?,
        received_at: row.get(8)?,
    })
}
