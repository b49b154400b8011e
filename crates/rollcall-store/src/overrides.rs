//! Manual attendance overrides and their audit log.
//!
//! Faculty can mark students present that recognition missed. Each override
//! rewrites the student's ledger fact as a manual "present" record and
//! leaves an audit row with the stated reason.

use crate::db::{Store, StoreError};
use crate::ledger::{stored_status, write_fact};
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::attendance::BulkFailure;
use rollcall_core::{
    AttendanceFact, AttendanceStatus, BulkUpsertReport, FactSource, SectionKey, SubjectKey,
};
use rusqlite::{params, Connection};
use serde::Serialize;
use uuid::Uuid;

/// Minimum length of an override reason, after trimming.
pub const MIN_REASON_LEN: usize = 20;
const LOG_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct ManualOverride {
    pub person_ids: Vec<String>,
    pub date: NaiveDate,
    pub section: SectionKey,
    pub subject: SubjectKey,
    pub faculty_id: String,
    pub faculty_name: Option<String>,
    pub reason: String,
}

impl ManualOverride {
    fn validate(&self) -> Result<(), StoreError> {
        if self.person_ids.is_empty() {
            return Err(StoreError::InvalidOverride("no students selected".into()));
        }
        if self.faculty_id.trim().is_empty() {
            return Err(StoreError::InvalidOverride("faculty id is required".into()));
        }
        if self.reason.trim().chars().count() < MIN_REASON_LEN {
            return Err(StoreError::InvalidOverride(format!(
                "reason must be at least {MIN_REASON_LEN} characters"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideOutcome {
    pub override_count: usize,
    pub writes: BulkUpsertReport,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideLogEntry {
    pub id: String,
    pub roll_no: String,
    pub faculty_id: String,
    pub faculty_name: Option<String>,
    pub subject: String,
    pub section: String,
    pub date: String,
    pub previous_status: Option<String>,
    pub reason: String,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct OverrideLogFilter {
    pub faculty_id: Option<String>,
    pub date: Option<NaiveDate>,
    pub section: Option<SectionKey>,
}

impl Store {
    /// Mark the listed students present and append one audit row each.
    ///
    /// Each student's ledger fact and audit row are written in one
    /// transaction; a student whose transaction fails keeps the previous
    /// fact and is listed in the outcome's failures.
    pub fn apply_override(
        &self,
        req: &ManualOverride,
        now: DateTime<Utc>,
    ) -> Result<OverrideOutcome, StoreError> {
        req.validate()?;
        let reason = req.reason.trim();

        let mut writes = BulkUpsertReport {
            attempted: req.person_ids.len(),
            ..Default::default()
        };
        let mut conn = self.conn();
        for (index, person_id) in req.person_ids.iter().enumerate() {
            let fact = AttendanceFact {
                person_id: person_id.clone(),
                date: req.date,
                section: req.section.clone(),
                subject: req.subject.clone(),
                status: AttendanceStatus::Present,
                faculty_id: req.faculty_id.clone(),
                captured_at: now,
                source: FactSource::Manual,
            };
            match record_override(&mut conn, &fact, req, reason, now) {
                Ok(()) => writes.written += 1,
                Err(err) => {
                    tracing::warn!(person_id = %person_id, error = %err, "override not recorded");
                    writes.failures.push(BulkFailure {
                        index,
                        person_id: person_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        drop(conn);

        tracing::info!(
            faculty_id = %req.faculty_id,
            students = writes.written,
            failed = writes.failures.len(),
            "manual override applied"
        );

        Ok(OverrideOutcome {
            override_count: writes.written,
            writes,
            recorded_at: now,
        })
    }

    /// Most recent override rows matching `filter`, newest first.
    pub fn override_log(
        &self,
        filter: &OverrideLogFilter,
    ) -> Result<Vec<OverrideLogEntry>, StoreError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if let Some(faculty_id) = &filter.faculty_id {
            clauses.push("faculty_id = ?");
            values.push(faculty_id.clone());
        }
        if let Some(date) = filter.date {
            clauses.push("date = ?");
            values.push(date.to_string());
        }
        if let Some(section) = &filter.section {
            clauses.push("section_key = ? COLLATE NOCASE");
            values.push(section.code());
        }

        let mut sql = String::from(
            "SELECT id, person_id, faculty_id, faculty_name, subject_key, section_key,
                    date, previous_status, reason, recorded_at
             FROM override_log",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY recorded_at DESC LIMIT {LOG_LIMIT}"));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
            Ok(OverrideLogEntry {
                id: row.get(0)?,
                roll_no: row.get(1)?,
                faculty_id: row.get(2)?,
                faculty_name: row.get(3)?,
                subject: row.get(4)?,
                section: row.get(5)?,
                date: row.get(6)?,
                previous_status: row.get(7)?,
                reason: row.get(8)?,
                recorded_at: row.get(9)?,
            })
        })?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn record_override(
    conn: &mut Connection,
    fact: &AttendanceFact,
    req: &ManualOverride,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    let previous = stored_status(&tx, &fact.key())
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    write_fact(&tx, fact)?;
    tx.execute(
        "INSERT INTO override_log
           (id, person_id, faculty_id, faculty_name, subject_key, section_key,
            date, previous_status, reason, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            Uuid::new_v4().to_string(),
            fact.person_id,
            req.faculty_id,
            req.faculty_name,
            fact.subject.as_str(),
            fact.section.code(),
            fact.date.to_string(),
            previous.map(|s| s.as_str()),
            reason,
            now.to_rfc3339(),
        ],
    )?;
    tx.commit()?;
    Ok(())
}
