use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use rusqlite::Connection;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS students (
  person_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  department TEXT NOT NULL,
  section TEXT NOT NULL,
  embedding TEXT NOT NULL,
  model TEXT NOT NULL DEFAULT 'arcface',
  registered_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_students_section
  ON students(department, section);

CREATE TABLE IF NOT EXISTS attendance (
  person_id TEXT NOT NULL,
  date TEXT NOT NULL,
  section_key TEXT NOT NULL,
  department TEXT,
  section TEXT NOT NULL,
  subject_key TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('present', 'absent')),
  faculty_id TEXT NOT NULL,
  captured_at TEXT NOT NULL,
  source TEXT NOT NULL,
  PRIMARY KEY (person_id, date, section_key, subject_key)
);

CREATE INDEX IF NOT EXISTS idx_attendance_class
  ON attendance(subject_key, section_key, date);

CREATE TABLE IF NOT EXISTS override_log (
  id TEXT PRIMARY KEY,
  person_id TEXT NOT NULL,
  faculty_id TEXT NOT NULL,
  faculty_name TEXT,
  subject_key TEXT NOT NULL,
  section_key TEXT NOT NULL,
  date TEXT NOT NULL,
  previous_status TEXT,
  reason TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_override_log_faculty
  ON override_log(faculty_id, recorded_at);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("embedding encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("roll number already registered: {0}")]
    Duplicate(String),
    #[error("invalid override: {0}")]
    InvalidOverride(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// SQLite-backed document store. One connection, serialized by a mutex;
/// every statement is atomic on its own.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
