//! Attendance facts and the ledger contract.
//!
//! A fact is keyed by (person, date, section, subject). Writing a fact whose
//! key already exists replaces the stored record wholesale, so replaying a
//! session is idempotent.

use crate::resolver::{SectionKey, SubjectKey};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(Self::Present),
            "absent" => Ok(Self::Absent),
            other => Err(LedgerError::Corrupt(format!("unknown status '{other}'"))),
        }
    }
}

/// How a fact was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FactSource {
    SingleFrame,
    Batch,
    Manual,
}

impl FactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleFrame => "single-frame",
            Self::Batch => "batch",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for FactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FactSource {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single-frame" => Ok(Self::SingleFrame),
            "batch" => Ok(Self::Batch),
            "manual" => Ok(Self::Manual),
            other => Err(LedgerError::Corrupt(format!("unknown source '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceFact {
    pub person_id: String,
    pub date: NaiveDate,
    pub section: SectionKey,
    pub subject: SubjectKey,
    pub status: AttendanceStatus,
    pub faculty_id: String,
    pub captured_at: DateTime<Utc>,
    pub source: FactSource,
}

impl AttendanceFact {
    pub fn key(&self) -> LedgerKey {
        LedgerKey {
            person_id: self.person_id.clone(),
            date: self.date,
            section: self.section.code(),
            subject: self.subject.clone(),
        }
    }

    pub fn is_present(&self) -> bool {
        self.status == AttendanceStatus::Present
    }
}

/// Upsert key; the section is compared in its stored code form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    pub person_id: String,
    pub date: NaiveDate,
    pub section: String,
    pub subject: SubjectKey,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("failed to write attendance for {person_id}: {reason}")]
    WriteFailure { person_id: String, reason: String },
    #[error("ledger read failed: {0}")]
    Read(String),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

/// One failed item of a bulk upsert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkFailure {
    pub index: usize,
    pub person_id: String,
    pub error: String,
}

/// Per-item outcome of [`AttendanceLedger::bulk_upsert`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkUpsertReport {
    pub attempted: usize,
    pub written: usize,
    pub failures: Vec<BulkFailure>,
}

impl BulkUpsertReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Conjunctive filter; `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct FactFilter {
    pub person_id: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// Matched with [`SectionKey::covers`], so a bare section spans departments.
    pub section: Option<SectionKey>,
    pub subject: Option<SubjectKey>,
    pub faculty_id: Option<String>,
    pub status: Option<AttendanceStatus>,
}

impl FactFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn person(mut self, person_id: impl Into<String>) -> Self {
        self.person_id = Some(person_id.into());
        self
    }

    pub fn between(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }

    pub fn section(mut self, section: SectionKey) -> Self {
        self.section = Some(section);
        self
    }

    pub fn subject(mut self, subject: SubjectKey) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn faculty(mut self, faculty_id: impl Into<String>) -> Self {
        self.faculty_id = Some(faculty_id.into());
        self
    }

    pub fn status(mut self, status: AttendanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, fact: &AttendanceFact) -> bool {
        self.person_id.as_ref().map_or(true, |p| *p == fact.person_id)
            && self.date_from.map_or(true, |d| fact.date >= d)
            && self.date_to.map_or(true, |d| fact.date <= d)
            && self.section.as_ref().map_or(true, |s| s.covers(&fact.section))
            && self.subject.as_ref().map_or(true, |s| *s == fact.subject)
            && self.faculty_id.as_ref().map_or(true, |f| *f == fact.faculty_id)
            && self.status.map_or(true, |s| s == fact.status)
    }
}

/// Store of attendance facts with upsert semantics.
pub trait AttendanceLedger {
    /// Insert or fully replace the fact stored under `fact.key()`.
    fn upsert(&self, fact: &AttendanceFact) -> Result<(), LedgerError>;

    /// Facts matching `filter`, ordered by date, subject, section, person.
    fn query(&self, filter: &FactFilter) -> Result<Vec<AttendanceFact>, LedgerError>;

    /// Upsert each fact independently; failures do not stop later writes.
    fn bulk_upsert(&self, facts: &[AttendanceFact]) -> BulkUpsertReport {
        let mut report = BulkUpsertReport {
            attempted: facts.len(),
            ..Default::default()
        };
        for (index, fact) in facts.iter().enumerate() {
            match self.upsert(fact) {
                Ok(()) => report.written += 1,
                Err(err) => {
                    tracing::warn!(
                        index,
                        person_id = %fact.person_id,
                        error = %err,
                        "attendance write failed"
                    );
                    report.failures.push(BulkFailure {
                        index,
                        person_id: fact.person_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Distinct subject keys present in the ledger, sorted.
    fn subjects(&self) -> Result<BTreeSet<SubjectKey>, LedgerError> {
        Ok(self
            .query(&FactFilter::all())?
            .into_iter()
            .map(|f| f.subject)
            .collect())
    }
}

/// In-process ledger, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    facts: RwLock<BTreeMap<LedgerKey, AttendanceFact>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.facts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttendanceLedger for MemoryLedger {
    fn upsert(&self, fact: &AttendanceFact) -> Result<(), LedgerError> {
        let mut facts = self.facts.write().unwrap_or_else(PoisonError::into_inner);
        facts.insert(fact.key(), fact.clone());
        Ok(())
    }

    fn query(&self, filter: &FactFilter) -> Result<Vec<AttendanceFact>, LedgerError> {
        let facts = self.facts.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<AttendanceFact> =
            facts.values().filter(|f| filter.matches(f)).cloned().collect();
        out.sort_by_key(|f| (f.date, f.subject.clone(), f.section.code(), f.person_id.clone()));
        Ok(out)
    }
}
