use anyhow::{Context, Result};
use rollcall_core::resolver::{default_subject_mappings, SubjectMapping};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Percentage under which a student is flagged for low attendance.
    pub low_attendance_pct: f64,
    /// Upper bound in seconds for matching one image batch.
    pub batch_timeout_secs: u64,
    /// Optional TOML file with the subject name/code table.
    pub subjects_file: Option<PathBuf>,
}

/// `[[subject]]` tables of a subjects file.
#[derive(Debug, Deserialize)]
struct SubjectsFile {
    #[serde(default, rename = "subject")]
    subjects: Vec<SubjectMapping>,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        Self {
            db_path,
            similarity_threshold: env_parse(
                "ROLLCALL_SIMILARITY_THRESHOLD",
                rollcall_core::DEFAULT_SIMILARITY_THRESHOLD,
            ),
            low_attendance_pct: env_parse(
                "ROLLCALL_LOW_ATTENDANCE_PCT",
                rollcall_core::analytics::LOW_ATTENDANCE_PCT,
            ),
            batch_timeout_secs: env_parse("ROLLCALL_BATCH_TIMEOUT_SECS", 30),
            subjects_file: std::env::var("ROLLCALL_SUBJECTS_FILE").ok().map(PathBuf::from),
        }
    }

    /// Subject mapping table: the configured file, or the built-in defaults.
    pub fn subject_mappings(&self) -> Result<Vec<SubjectMapping>> {
        match &self.subjects_file {
            Some(path) => load_subjects(path),
            None => Ok(default_subject_mappings()),
        }
    }
}

fn load_subjects(path: &Path) -> Result<Vec<SubjectMapping>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading subjects file {}", path.display()))?;
    let file: SubjectsFile =
        toml::from_str(&text).with_context(|| format!("parsing subjects file {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        subjects = file.subjects.len(),
        "loaded subject mappings"
    );
    Ok(file.subjects)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
