mod config;
mod input;
mod service;

use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rollcall_core::{EntityResolver, FactSource, StudentInfo};
use rollcall_store::{ManualOverride, OverrideLogFilter, Store};
use serde::Serialize;
use service::{AttendanceService, BatchRequest};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rollcall", about = "Classroom attendance from face embeddings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student from the detections of one photo
    Enroll {
        #[arg(long)]
        roll_no: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        department: String,
        #[arg(long)]
        section: String,
        /// Detector output JSON for the enrollment photo
        #[arg(long)]
        detections: PathBuf,
        /// Replace an existing enrollment with the same roll number
        #[arg(long)]
        overwrite: bool,
    },
    /// Match the faces of a single frame without recording attendance
    Recognize {
        #[arg(long)]
        detections: PathBuf,
    },
    /// Take attendance for a class from a batch of images
    Attend {
        /// Class name, e.g. "Data Structures (AIML-B)"
        #[arg(long = "class")]
        class_name: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        faculty: String,
        /// Session date (defaults to today, UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Detector output JSON, one entry per image
        #[arg(long)]
        images: PathBuf,
        /// Recorded source: batch or single-frame
        #[arg(long, default_value = "batch")]
        source: FactSource,
    },
    /// Mark students present by hand
    Override {
        #[arg(long = "class")]
        class_name: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        faculty: String,
        #[arg(long)]
        faculty_name: Option<String>,
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Why recognition missed these students (at least 20 characters)
        #[arg(long)]
        reason: String,
        /// Roll numbers to mark present
        #[arg(required = true)]
        students: Vec<String>,
    },
    /// Show the manual override audit log
    Overrides {
        #[arg(long)]
        faculty: Option<String>,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long = "class")]
        class_name: Option<String>,
    },
    /// Attendance reports
    Report {
        #[command(subcommand)]
        report: ReportCommand,
    },
    /// List enrolled students
    Students {
        /// Only students on this class's roster
        #[arg(long = "class")]
        class_name: Option<String>,
    },
    /// Delete every attendance record (enrollments are kept)
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ReportCommand {
    /// Overall, per-subject and recent attendance of one student
    Student { roll_no: String },
    /// Per-student attendance for one subject in one class
    Class {
        #[arg(long)]
        subject: String,
        #[arg(long = "class")]
        class_name: String,
    },
    /// Section overview, subject statistics and low-attendance alerts
    Dashboard {
        #[arg(long = "class")]
        class_name: String,
    },
    /// Students below the attendance threshold
    Low {
        #[arg(long = "class")]
        class_name: String,
        /// Percentage threshold (defaults to ROLLCALL_LOW_ATTENDANCE_PCT)
        #[arg(long)]
        threshold: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = config::Config::from_env();
    let resolver = EntityResolver::new(&config.subject_mappings()?);
    let store = Arc::new(Store::open(&config.db_path)?);
    tracing::debug!(db = %config.db_path.display(), "store opened");
    let svc = Arc::new(AttendanceService::new(store, resolver, config.similarity_threshold));
    let today = || Utc::now().date_naive();

    match cli.command {
        Commands::Enroll {
            roll_no,
            name,
            department,
            section,
            detections,
            overwrite,
        } => {
            let image = input::load_image(&detections)?;
            let info = StudentInfo {
                person_id: roll_no,
                display_name: name,
                department,
                section,
            };
            let record = svc.enroll(info, &image.detections, overwrite)?;
            print_json(&record.info())?;
        }
        Commands::Recognize { detections } => {
            let image = input::load_image(&detections)?;
            print_json(&svc.recognize_frame(&image.detections)?)?;
        }
        Commands::Attend {
            class_name,
            subject,
            faculty,
            date,
            images,
            source,
        } => {
            let req = BatchRequest {
                class_name,
                subject,
                faculty_id: faculty,
                date: date.unwrap_or_else(today),
                images: input::load_batch(&images)?,
                source,
            };
            let limit = Duration::from_secs(config.batch_timeout_secs);
            let summary = svc.take_attendance(req, limit).await?;
            print_json(&summary)?;
        }
        Commands::Override {
            class_name,
            subject,
            faculty,
            faculty_name,
            date,
            reason,
            students,
        } => {
            let req = ManualOverride {
                person_ids: students,
                date: date.unwrap_or_else(today),
                section: svc.resolver().resolve_section(&class_name),
                subject: svc.resolve_subject(&subject)?,
                faculty_id: faculty,
                faculty_name,
                reason,
            };
            print_json(&svc.manual_override(&req)?)?;
        }
        Commands::Overrides {
            faculty,
            date,
            class_name,
        } => {
            let filter = OverrideLogFilter {
                faculty_id: faculty,
                date,
                section: class_name.map(|c| svc.resolver().resolve_section(&c)),
            };
            print_json(&svc.store().override_log(&filter)?)?;
        }
        Commands::Report { report } => match report {
            ReportCommand::Student { roll_no } => print_json(&svc.student_report(&roll_no)?)?,
            ReportCommand::Class {
                subject,
                class_name,
            } => print_json(&svc.class_report(&subject, &class_name)?)?,
            ReportCommand::Dashboard { class_name } => print_json(&svc.dashboard(&class_name)?)?,
            ReportCommand::Low { class_name, threshold } => {
                let threshold = threshold.unwrap_or(config.low_attendance_pct);
                print_json(&svc.low_attendance(&class_name, threshold)?)?
            }
        },
        Commands::Students { class_name } => {
            let students = match class_name {
                Some(c) => svc.roster(&c)?,
                None => svc.store().students()?,
            };
            print_json(&students)?;
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("refusing to delete attendance records without --yes");
            }
            let removed = svc.store().clear_attendance()?;
            println!("removed {removed} attendance records");
        }
    }

    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
