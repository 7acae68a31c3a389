use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::policy::ApprovalStatus;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// An attendance entry about to be written.
#[derive(Clone, Debug, PartialEq)]
pub struct NewAttendance {
    pub subject_id: String,
    pub confidence: f32,
    pub status: ApprovalStatus,
    pub timestamp: DateTime<Utc>,
}

impl NewAttendance {
    /// Entry with a generated `user_<unix seconds>` subject id.
    pub fn generated(confidence: f32, status: ApprovalStatus, timestamp: DateTime<Utc>) -> Self {
        Self {
            subject_id: format!("user_{}", timestamp.timestamp()),
            confidence,
            status,
            timestamp,
        }
    }
}

/// A persisted attendance entry.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    #[serde(rename = "user_id")]
    pub subject_id: String,
    pub confidence: f32,
    pub status: ApprovalStatus,
    pub timestamp: DateTime<Utc>,
}

pub trait AttendanceRecorder: Send {
    fn record(&mut self, entry: &NewAttendance) -> Result<AttendanceRecord>;

    /// Most recent records first.
    fn recent(&mut self, limit: usize) -> Result<Vec<AttendanceRecord>>;
}

pub struct SqliteAttendanceStore {
    conn: Connection,
}

impl SqliteAttendanceStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open attendance database {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS attendance (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id TEXT,
              confidence REAL,
              status TEXT DEFAULT 'Pending',
              timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_attendance_timestamp ON attendance(timestamp);
            "#,
            )
            .context("create attendance schema")?;
        Ok(())
    }
}

impl AttendanceRecorder for SqliteAttendanceStore {
    fn record(&mut self, entry: &NewAttendance) -> Result<AttendanceRecord> {
        self.conn
            .execute(
                r#"
            INSERT INTO attendance(user_id, confidence, status, timestamp)
            VALUES (?1, ?2, ?3, ?4)
            "#,
                params![
                    entry.subject_id,
                    f64::from(entry.confidence),
                    entry.status.as_str(),
                    entry.timestamp.format(TIMESTAMP_FORMAT).to_string()
                ],
            )
            .context("insert attendance record")?;

        Ok(AttendanceRecord {
            id: self.conn.last_insert_rowid(),
            subject_id: entry.subject_id.clone(),
            confidence: entry.confidence,
            status: entry.status,
            timestamp: entry.timestamp,
        })
    }

    fn recent(&mut self, limit: usize) -> Result<Vec<AttendanceRecord>> {
        let limit = i64::try_from(limit).map_err(|_| anyhow!("history limit exceeds i64 range"))?;
        let rows = {
            let mut stmt = self.conn.prepare(
                "SELECT id, user_id, confidence, status, timestamp FROM attendance ORDER BY timestamp DESC, id DESC LIMIT ?1",
            )?;
            let mut rows = stmt.query(params![limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let subject_id: Option<String> = row.get(1)?;
                let confidence: Option<f64> = row.get(2)?;
                let status: Option<String> = row.get(3)?;
                let timestamp: String = row.get(4)?;
                out.push((id, subject_id, confidence, status, timestamp));
            }
            out
        };

        rows.into_iter()
            .map(|(id, subject_id, confidence, status, timestamp)| -> Result<AttendanceRecord> {
                Ok(AttendanceRecord {
                    id,
                    subject_id: subject_id.unwrap_or_default(),
                    confidence: confidence.unwrap_or(0.0) as f32,
                    status: ApprovalStatus::parse(status.as_deref().unwrap_or("Pending"))?,
                    timestamp: parse_timestamp(&timestamp)
                        .with_context(|| format!("attendance record {}", id))?,
                })
            })
            .collect()
    }
}

/// Accepts both our millisecond format and SQLite's `CURRENT_TIMESTAMP`.
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value, TIMESTAMP_PARSE_FORMAT)
        .with_context(|| format!("parse timestamp '{}'", value))?;
    Ok(naive.and_utc())
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryAttendanceStore {
    records: Vec<AttendanceRecord>,
}

impl InMemoryAttendanceStore {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl AttendanceRecorder for InMemoryAttendanceStore {
    fn record(&mut self, entry: &NewAttendance) -> Result<AttendanceRecord> {
        let record = AttendanceRecord {
            id: self.records.len() as i64 + 1,
            subject_id: entry.subject_id.clone(),
            confidence: entry.confidence,
            status: entry.status,
            timestamp: entry.timestamp,
        };
        self.records.push(record.clone());
        Ok(record)
    }

    fn recent(&mut self, limit: usize) -> Result<Vec<AttendanceRecord>> {
        let mut out = self.records.clone();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        out.truncate(limit);
        Ok(out)
    }
}
