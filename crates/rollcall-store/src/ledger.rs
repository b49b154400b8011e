//! SQLite attendance ledger.

use crate::db::Store;
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::attendance::LedgerKey;
use rollcall_core::{
    AttendanceFact, AttendanceLedger, AttendanceStatus, FactFilter, LedgerError, SectionKey,
    SubjectKey,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::BTreeSet;

const DATE_FORMAT: &str = "%Y-%m-%d";

struct FactRow {
    person_id: String,
    date: String,
    department: Option<String>,
    section: String,
    subject: String,
    status: String,
    faculty_id: String,
    captured_at: String,
    source: String,
}

impl FactRow {
    fn into_fact(self) -> Result<AttendanceFact, LedgerError> {
        let date = NaiveDate::parse_from_str(&self.date, DATE_FORMAT)
            .map_err(|e| LedgerError::Corrupt(format!("date '{}': {e}", self.date)))?;
        let captured_at = DateTime::parse_from_rfc3339(&self.captured_at)
            .map_err(|e| LedgerError::Corrupt(format!("captured_at '{}': {e}", self.captured_at)))?
            .with_timezone(&Utc);

        Ok(AttendanceFact {
            person_id: self.person_id,
            date,
            section: SectionKey {
                department: self.department,
                section: self.section,
            },
            subject: SubjectKey::new(self.subject),
            status: self.status.parse()?,
            faculty_id: self.faculty_id,
            captured_at,
            source: self.source.parse()?,
        })
    }
}

fn read_err(e: rusqlite::Error) -> LedgerError {
    LedgerError::Read(e.to_string())
}

/// Insert or fully replace the fact stored under the same ledger key.
pub(crate) fn write_fact(conn: &Connection, fact: &AttendanceFact) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO attendance
           (person_id, date, section_key, department, section, subject_key,
            status, faculty_id, captured_at, source)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(person_id, date, section_key, subject_key) DO UPDATE SET
           department = excluded.department,
           section = excluded.section,
           status = excluded.status,
           faculty_id = excluded.faculty_id,
           captured_at = excluded.captured_at,
           source = excluded.source",
        params![
            fact.person_id,
            fact.date.format(DATE_FORMAT).to_string(),
            fact.section.code(),
            fact.section.department,
            fact.section.section,
            fact.subject.as_str(),
            fact.status.as_str(),
            fact.faculty_id,
            fact.captured_at.to_rfc3339(),
            fact.source.as_str(),
        ],
    )
}

/// Status currently stored under `key`, if any.
pub(crate) fn stored_status(
    conn: &Connection,
    key: &LedgerKey,
) -> Result<Option<AttendanceStatus>, LedgerError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM attendance
             WHERE person_id = ?1 AND date = ?2 AND section_key = ?3 AND subject_key = ?4",
            params![
                key.person_id,
                key.date.format(DATE_FORMAT).to_string(),
                key.section,
                key.subject.as_str(),
            ],
            |row| row.get(0),
        )
        .optional()
        .map_err(read_err)?;
    status.map(|s| s.parse()).transpose()
}

impl AttendanceLedger for Store {
    fn upsert(&self, fact: &AttendanceFact) -> Result<(), LedgerError> {
        write_fact(&self.conn(), fact).map_err(|e| LedgerError::WriteFailure {
            person_id: fact.person_id.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn query(&self, filter: &FactFilter) -> Result<Vec<AttendanceFact>, LedgerError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(person_id) = &filter.person_id {
            clauses.push("person_id = ?");
            values.push(person_id.clone());
        }
        if let Some(from) = filter.date_from {
            clauses.push("date >= ?");
            values.push(from.format(DATE_FORMAT).to_string());
        }
        if let Some(to) = filter.date_to {
            clauses.push("date <= ?");
            values.push(to.format(DATE_FORMAT).to_string());
        }
        if let Some(subject) = &filter.subject {
            clauses.push("subject_key = ?");
            values.push(subject.as_str().to_string());
        }
        if let Some(section) = &filter.section {
            clauses.push("section = ? COLLATE NOCASE");
            values.push(section.section.clone());
        }
        if let Some(faculty_id) = &filter.faculty_id {
            clauses.push("faculty_id = ?");
            values.push(faculty_id.clone());
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(status.as_str().to_string());
        }

        let mut sql = String::from(
            "SELECT person_id, date, department, section, subject_key, status, faculty_id,
                    captured_at, source
             FROM attendance",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY date, subject_key, section_key, person_id");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql).map_err(read_err)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(FactRow {
                    person_id: row.get(0)?,
                    date: row.get(1)?,
                    department: row.get(2)?,
                    section: row.get(3)?,
                    subject: row.get(4)?,
                    status: row.get(5)?,
                    faculty_id: row.get(6)?,
                    captured_at: row.get(7)?,
                    source: row.get(8)?,
                })
            })
            .map_err(read_err)?;

        let mut facts = Vec::new();
        for row in rows {
            let fact = row.map_err(read_err)?.into_fact()?;
            // Department matching follows SectionKey::covers, which SQL alone does not express.
            if filter.matches(&fact) {
                facts.push(fact);
            }
        }
        Ok(facts)
    }

    fn subjects(&self) -> Result<BTreeSet<SubjectKey>, LedgerError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT DISTINCT subject_key FROM attendance")
            .map_err(read_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(read_err)?;
        let subjects = rows.map(|r| r.map(SubjectKey::new).map_err(read_err)).collect();
        subjects
    }
}

impl Store {
    /// Delete every attendance fact. Operator reset only; returns the row count.
    pub fn clear_attendance(&self) -> Result<usize, LedgerError> {
        let conn = self.conn();
        let deleted = conn
            .execute("DELETE FROM attendance", [])
            .map_err(|e| LedgerError::WriteFailure {
                person_id: "*".into(),
                reason: e.to_string(),
            })?;
        tracing::warn!(deleted, "attendance ledger cleared");
        Ok(deleted)
    }
}
