//! Service root: owns the gallery cache, the store and the resolver, and
//! runs the recognition → aggregation → ledger pipeline for one request.

use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::analytics::{
    AnalyticsError, ClassReport, Dashboard, LowAttendance, StudentReport,
};
use rollcall_core::session::Presence;
use rollcall_core::{
    build_identity, AnalyticsEngine, AttendanceLedger, BulkUpsertReport, CosineMatcher, Detection,
    EnrollError, EntityResolver, FactSource, GalleryCache, GalleryError, GallerySource,
    IdentityRecord, LedgerError, MatchResult, Matcher, SessionAggregator, SessionKey,
    SessionObservation, StudentInfo, SubjectKey,
};
use rollcall_store::{ManualOverride, OverrideOutcome, Store, StoreError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::input::ImageDetections;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Analytics(#[from] AnalyticsError),
    #[error("attendance batch exceeded {0:?}; nothing was recorded")]
    Timeout(Duration),
    #[error("worker task failed: {0}")]
    Task(String),
}

/// One attendance-taking request: a class, a subject and its image batch.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub class_name: String,
    pub subject: String,
    pub faculty_id: String,
    pub date: NaiveDate,
    pub images: Vec<ImageDetections>,
    pub source: FactSource,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentStudent {
    pub roll_no: String,
    pub name: String,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbsentStudent {
    pub roll_no: String,
    pub name: String,
}

/// What the caller gets back after a batch is recorded.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session: SessionKey,
    pub present: Vec<PresentStudent>,
    pub absent: Vec<AbsentStudent>,
    pub present_count: usize,
    pub absent_count: usize,
    pub roster_empty: bool,
    pub off_roster: Vec<String>,
    pub unknown_faces: usize,
    pub images: usize,
    pub writes: BulkUpsertReport,
}

/// Gallery is read through `G`; by default straight from the store.
pub struct AttendanceService<G = Arc<Store>> {
    store: Arc<Store>,
    gallery: GalleryCache<G>,
    resolver: EntityResolver,
    threshold: f32,
}

impl AttendanceService {
    pub fn new(store: Arc<Store>, resolver: EntityResolver, threshold: f32) -> Self {
        Self::with_gallery_source(Arc::clone(&store), store, resolver, threshold)
    }
}

impl<G: GallerySource> AttendanceService<G> {
    pub fn with_gallery_source(
        source: G,
        store: Arc<Store>,
        resolver: EntityResolver,
        threshold: f32,
    ) -> Self {
        Self {
            gallery: GalleryCache::new(source),
            store,
            resolver,
            threshold,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    /// Validate an enrollment photo's detections and store the identity.
    pub fn enroll(
        &self,
        info: StudentInfo,
        detections: &[Detection],
        overwrite: bool,
    ) -> Result<IdentityRecord, ServiceError> {
        let record = build_identity(info, detections)?;
        self.store.enroll(&record, overwrite)?;
        self.gallery.invalidate();
        Ok(record)
    }

    /// Match every face of a single frame without recording attendance.
    pub fn recognize_frame(
        &self,
        detections: &[Detection],
    ) -> Result<Vec<MatchResult>, ServiceError> {
        let mut gallery = self.gallery.load()?;
        if gallery.is_empty() {
            self.gallery.invalidate();
            gallery = self.gallery.load()?;
        }
        Ok(CosineMatcher.match_all(detections, &gallery, self.threshold))
    }

    /// Canonical subject for a raw name, checked against ledger subjects.
    pub fn resolve_subject(&self, raw: &str) -> Result<SubjectKey, ServiceError> {
        let known = self.store.subjects()?;
        let resolution = self.resolver.resolve_subject(raw, &known);
        tracing::debug!(
            raw,
            subject = %resolution.key,
            strategy = ?resolution.strategy,
            "resolved subject"
        );
        Ok(resolution.key)
    }

    /// Canonical session key for a request.
    pub fn session_key(&self, req: &BatchRequest) -> Result<SessionKey, ServiceError> {
        let subject = self.resolve_subject(&req.subject)?;
        let section = self.resolver.resolve_section(&req.class_name);
        tracing::debug!(raw_class = %req.class_name, section = %section, "resolved section");
        Ok(SessionKey {
            date: req.date,
            subject,
            section,
            faculty_id: req.faculty_id.clone(),
        })
    }

    /// Match all images of the batch in memory. Writes nothing.
    pub fn aggregate(&self, req: &BatchRequest) -> Result<SessionObservation, ServiceError> {
        let gallery = self.gallery.load()?;
        let key = self.session_key(req)?;
        let students = self.store.students()?;
        let roster = self.resolver.roster(&key.section, &students);

        let aggregator = SessionAggregator::new(&gallery, CosineMatcher, self.threshold);
        let mut session = aggregator.begin_session(key, roster);
        for image in &req.images {
            let captured_at = image.captured_at.unwrap_or_else(Utc::now);
            tracing::debug!(
                image = image.image.as_deref().unwrap_or("-"),
                %captured_at,
                "matching image"
            );
            aggregator.observe_image(&mut session, &image.detections, captured_at);
        }
        Ok(aggregator.finalize(session))
    }

    /// Write a finalized session to the ledger and summarize it. The write
    /// report is always returned; names missing from the directory show as
    /// "Unknown".
    pub fn persist(&self, observation: &SessionObservation, source: FactSource) -> SessionSummary {
        if observation.roster_empty {
            tracing::warn!(
                section = %observation.key.section,
                "no roster for section; nothing recorded"
            );
        }

        let names: BTreeMap<String, String> = match self.store.students() {
            Ok(students) => students
                .into_iter()
                .map(|s| (s.person_id, s.display_name))
                .collect(),
            Err(err) => {
                tracing::warn!(error = %err, "student directory unavailable for summary names");
                BTreeMap::new()
            }
        };

        let facts = observation.facts(source);
        let writes = self.store.bulk_upsert(&facts);
        tracing::info!(
            section = %observation.key.section,
            subject = %observation.key.subject,
            present = observation.present.len(),
            absent = observation.absent.len(),
            written = writes.written,
            failed = writes.failures.len(),
            "attendance recorded"
        );

        let name_of = |id: &str, presence: Option<&Presence>| {
            presence
                .and_then(|p| p.display_name.clone())
                .or_else(|| names.get(id).cloned())
                .unwrap_or_else(|| "Unknown".to_string())
        };

        SessionSummary {
            session: observation.key.clone(),
            present: observation
                .present
                .iter()
                .map(|(id, p)| PresentStudent {
                    roll_no: id.clone(),
                    name: name_of(id, Some(p)),
                    first_seen: p.first_seen,
                })
                .collect(),
            absent: observation
                .absent
                .iter()
                .map(|id| AbsentStudent {
                    roll_no: id.clone(),
                    name: name_of(id, None),
                })
                .collect(),
            present_count: observation.present.len(),
            absent_count: observation.absent.len(),
            roster_empty: observation.roster_empty,
            off_roster: observation.off_roster.keys().cloned().collect(),
            unknown_faces: observation.unknown_faces,
            images: observation.images,
            writes,
        }
    }

    pub fn manual_override(&self, req: &ManualOverride) -> Result<OverrideOutcome, ServiceError> {
        Ok(self.store.apply_override(req, Utc::now())?)
    }

    fn with_analytics<T>(
        &self,
        f: impl FnOnce(&AnalyticsEngine<'_, Store>) -> Result<T, AnalyticsError>,
    ) -> Result<T, ServiceError> {
        let students = self.store.students()?;
        let engine = AnalyticsEngine::new(self.store.as_ref(), &students, &self.resolver);
        Ok(f(&engine)?)
    }

    pub fn student_report(&self, roll_no: &str) -> Result<StudentReport, ServiceError> {
        self.with_analytics(|a| a.student_report(roll_no))
    }

    pub fn class_report(
        &self,
        subject: &str,
        class_name: &str,
    ) -> Result<ClassReport, ServiceError> {
        self.with_analytics(|a| a.class_report(subject, class_name))
    }

    pub fn dashboard(&self, class_name: &str) -> Result<Dashboard, ServiceError> {
        let section = self.resolver.resolve_section(class_name);
        self.with_analytics(|a| a.dashboard(&section))
    }

    pub fn low_attendance(
        &self,
        class_name: &str,
        threshold_pct: f64,
    ) -> Result<Vec<LowAttendance>, ServiceError> {
        let section = self.resolver.resolve_section(class_name);
        self.with_analytics(|a| a.low_attendance(&section, threshold_pct))
    }

    /// Students on the roster of a raw class string.
    pub fn roster(&self, class_name: &str) -> Result<Vec<StudentInfo>, ServiceError> {
        let section = self.resolver.resolve_section(class_name);
        let students = self.store.students()?;
        let roster = self.resolver.roster(&section, &students);
        Ok(students.into_iter().filter(|s| roster.contains(&s.person_id)).collect())
    }
}

impl<G: GallerySource + Send + Sync + 'static> AttendanceService<G> {
    /// Aggregate a batch under a deadline, then record it. A batch that
    /// misses the deadline leaves the ledger untouched.
    pub async fn take_attendance(
        self: &Arc<Self>,
        req: BatchRequest,
        limit: Duration,
    ) -> Result<SessionSummary, ServiceError> {
        let source = req.source;
        let svc = Arc::clone(self);
        let observation = with_deadline(limit, move || svc.aggregate(&req)).await?;

        let svc = Arc::clone(self);
        tokio::task::spawn_blocking(move || svc.persist(&observation, source))
            .await
            .map_err(|e| ServiceError::Task(e.to_string()))
    }
}

/// Run blocking work on the blocking pool, giving up after `limit`.
async fn with_deadline<T, F>(limit: Duration, work: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(work);
    tokio::time::timeout(limit, task)
        .await
        .map_err(|_| ServiceError::Timeout(limit))?
        .map_err(|e| ServiceError::Task(e.to_string()))?
}
