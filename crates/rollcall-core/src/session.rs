//! Folding per-image match lists into one attendance session.
//!
//! A session is begun against a roster, observes the matches of every image
//! in the batch, and is finalized once. Nothing is persisted until the
//! finalized observation is turned into ledger facts.

use crate::attendance::{AttendanceFact, AttendanceStatus, FactSource};
use crate::gallery::Gallery;
use crate::matcher::Matcher;
use crate::resolver::{SectionKey, SubjectKey};
use crate::types::{Detection, MatchResult};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Identifies one conducted class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionKey {
    pub date: NaiveDate,
    pub subject: SubjectKey,
    pub section: SectionKey,
    pub faculty_id: String,
}

/// First sighting of a person within a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Presence {
    pub display_name: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub similarity: f32,
}

/// A session being accumulated. Consumed by [`Session::finalize`].
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    roster: BTreeSet<String>,
    present: BTreeMap<String, Presence>,
    off_roster: BTreeMap<String, Presence>,
    images: usize,
    unknown_faces: usize,
    last_capture: Option<DateTime<Utc>>,
}

impl Session {
    pub fn begin(key: SessionKey, roster: BTreeSet<String>) -> Self {
        Self {
            key,
            roster,
            present: BTreeMap::new(),
            off_roster: BTreeMap::new(),
            images: 0,
            unknown_faces: 0,
            last_capture: None,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Record one image's matches. Known faces keep their first-seen time;
    /// unknown faces only bump a counter.
    pub fn observe(&mut self, matches: &[MatchResult], captured_at: DateTime<Utc>) {
        self.images += 1;
        self.last_capture = Some(self.last_capture.map_or(captured_at, |t| t.max(captured_at)));

        for m in matches {
            let Some(person_id) = &m.person_id else {
                self.unknown_faces += 1;
                continue;
            };
            let bucket = if self.roster.contains(person_id) {
                &mut self.present
            } else {
                &mut self.off_roster
            };
            bucket.entry(person_id.clone()).or_insert_with(|| Presence {
                display_name: m.display_name.clone(),
                first_seen: captured_at,
                similarity: m.similarity,
            });
        }
    }

    pub fn finalize(self) -> SessionObservation {
        let absent: BTreeSet<String> = self
            .roster
            .iter()
            .filter(|id| !self.present.contains_key(*id))
            .cloned()
            .collect();

        if !self.off_roster.is_empty() {
            tracing::info!(
                section = %self.key.section,
                count = self.off_roster.len(),
                "recognized students outside the session roster"
            );
        }

        SessionObservation {
            roster_empty: self.roster.is_empty(),
            key: self.key,
            present: self.present,
            absent,
            off_roster: self.off_roster,
            images: self.images,
            unknown_faces: self.unknown_faces,
            last_capture: self.last_capture,
        }
    }
}

/// Immutable result of a finalized session.
///
/// `present` and `absent` partition the roster. `roster_empty` separates
/// "no roster for this section" from "nobody attended".
#[derive(Debug, Clone, Serialize)]
pub struct SessionObservation {
    pub key: SessionKey,
    pub present: BTreeMap<String, Presence>,
    pub absent: BTreeSet<String>,
    /// Recognized identities that are not on the roster; never written.
    pub off_roster: BTreeMap<String, Presence>,
    pub roster_empty: bool,
    pub images: usize,
    pub unknown_faces: usize,
    pub last_capture: Option<DateTime<Utc>>,
}

impl SessionObservation {
    /// Ledger facts for every roster member: present ones stamped with their
    /// first sighting, absent ones with the last capture of the batch.
    pub fn facts(&self, source: FactSource) -> Vec<AttendanceFact> {
        let closed_at = self
            .last_capture
            .unwrap_or_else(|| self.key.date.and_time(NaiveTime::MIN).and_utc());

        let present = self
            .present
            .iter()
            .map(|(id, p)| (id, AttendanceStatus::Present, p.first_seen));
        let absent = self.absent.iter().map(|id| (id, AttendanceStatus::Absent, closed_at));

        present
            .chain(absent)
            .map(|(id, status, captured_at)| AttendanceFact {
                person_id: id.clone(),
                date: self.key.date,
                section: self.key.section.clone(),
                subject: self.key.subject.clone(),
                status,
                faculty_id: self.key.faculty_id.clone(),
                captured_at,
                source,
            })
            .collect()
    }
}

/// Runs the matcher over image batches and feeds the results into sessions.
pub struct SessionAggregator<'g, M> {
    gallery: &'g Gallery,
    matcher: M,
    threshold: f32,
}

impl<'g, M: Matcher> SessionAggregator<'g, M> {
    pub fn new(gallery: &'g Gallery, matcher: M, threshold: f32) -> Self {
        Self {
            gallery,
            matcher,
            threshold,
        }
    }

    pub fn begin_session(&self, key: SessionKey, roster: BTreeSet<String>) -> Session {
        tracing::debug!(
            section = %key.section,
            subject = %key.subject,
            roster = roster.len(),
            "session started"
        );
        Session::begin(key, roster)
    }

    pub fn observe(
        &self,
        session: &mut Session,
        matches: &[MatchResult],
        captured_at: DateTime<Utc>,
    ) {
        session.observe(matches, captured_at);
    }

    /// Match every face of one image and record the matches.
    pub fn observe_image(
        &self,
        session: &mut Session,
        detections: &[Detection],
        captured_at: DateTime<Utc>,
    ) -> Vec<MatchResult> {
        let matches = self.matcher.match_all(detections, self.gallery, self.threshold);
        tracing::debug!(
            faces = detections.len(),
            known = matches.iter().filter(|m| m.is_known()).count(),
            "image observed"
        );
        session.observe(&matches, captured_at);
        matches
    }

    pub fn finalize(&self, session: Session) -> SessionObservation {
        session.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::CosineMatcher;
    use crate::types::{BoundingBox, Embedding, IdentityRecord};
    use chrono::TimeZone;

    fn key() -> SessionKey {
        SessionKey {
            date: NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            subject: SubjectKey::new("daa122"),
            section: SectionKey::new("AIML", "B"),
            faculty_id: "F001".into(),
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, 9, minute, 0).unwrap()
    }

    fn hit(id: &str) -> MatchResult {
        MatchResult {
            query_index: 0,
            person_id: Some(id.into()),
            display_name: Some(format!("name-{id}")),
            similarity: 0.9,
            bounding_box: BoundingBox::default(),
        }
    }

    fn roster(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_present_and_absent_partition_roster() {
        let mut s = Session::begin(key(), roster(&["S1", "S2", "S3"]));
        s.observe(&[hit("S1"), MatchResult::unknown(1, 0.1, BoundingBox::default())], at(0));
        s.observe(&[hit("S3"), hit("X9")], at(1));
        let obs = s.finalize();

        let present: BTreeSet<String> = obs.present.keys().cloned().collect();
        assert!(present.is_disjoint(&obs.absent));
        let union: BTreeSet<String> = present.union(&obs.absent).cloned().collect();
        assert_eq!(union, roster(&["S1", "S2", "S3"]));
        assert_eq!(obs.absent, roster(&["S2"]));
        assert!(obs.off_roster.contains_key("X9"));
        assert_eq!(obs.unknown_faces, 1);
        assert_eq!(obs.images, 2);
        assert!(!obs.roster_empty);
    }

    #[test]
    fn test_first_seen_time_is_kept() {
        let mut s = Session::begin(key(), roster(&["S1"]));
        s.observe(&[hit("S1")], at(1));
        s.observe(&[], at(2));
        s.observe(&[hit("S1")], at(3));
        let obs = s.finalize();
        assert_eq!(obs.present["S1"].first_seen, at(1));
        assert_eq!(obs.last_capture, Some(at(3)));
    }

    #[test]
    fn test_empty_roster_is_flagged_not_failed() {
        let mut s = Session::begin(key(), BTreeSet::new());
        s.observe(&[hit("S1")], at(0));
        let obs = s.finalize();
        assert!(obs.roster_empty);
        assert!(obs.present.is_empty());
        assert!(obs.absent.is_empty());
        assert!(obs.facts(FactSource::Batch).is_empty());
    }

    #[test]
    fn test_zero_attendance_is_not_empty_roster() {
        let obs = Session::begin(key(), roster(&["S1", "S2"])).finalize();
        assert!(!obs.roster_empty);
        assert_eq!(obs.absent.len(), 2);
    }

    #[test]
    fn test_facts_cover_roster() {
        let mut s = Session::begin(key(), roster(&["S1", "S2"]));
        s.observe(&[hit("S1")], at(5));
        s.observe(&[], at(7));
        let facts = s.finalize().facts(FactSource::Batch);
        assert_eq!(facts.len(), 2);

        let s1 = facts.iter().find(|f| f.person_id == "S1").unwrap();
        assert_eq!(s1.status, AttendanceStatus::Present);
        assert_eq!(s1.captured_at, at(5));
        let s2 = facts.iter().find(|f| f.person_id == "S2").unwrap();
        assert_eq!(s2.status, AttendanceStatus::Absent);
        assert_eq!(s2.captured_at, at(7));
        assert!(facts
            .iter()
            .all(|f| f.section == SectionKey::new("AIML", "B") && f.source == FactSource::Batch));
    }

    #[test]
    fn test_aggregator_matches_images() {
        let gallery = Gallery::from_records(&[
            IdentityRecord {
                person_id: "S1".into(),
                display_name: "Asha".into(),
                department: "AIML".into(),
                section: "B".into(),
                embedding: Embedding::new(vec![1.0, 0.0]),
            },
            IdentityRecord {
                person_id: "S2".into(),
                display_name: "Ravi".into(),
                department: "AIML".into(),
                section: "B".into(),
                embedding: Embedding::new(vec![0.0, 1.0]),
            },
        ])
        .unwrap();
        let agg = SessionAggregator::new(&gallery, CosineMatcher, 0.38);
        let mut session = agg.begin_session(key(), roster(&["S1", "S2"]));

        let face = |v: Vec<f32>| Detection {
            embedding: Embedding::new(v),
            bounding_box: BoundingBox::default(),
        };
        let faces = [face(vec![0.9, 0.1]), face(vec![-1.0, 0.0])];
        let matches = agg.observe_image(&mut session, &faces, at(0));
        assert_eq!(matches[0].person_id.as_deref(), Some("S1"));
        assert!(matches[1].person_id.is_none());

        let obs = agg.finalize(session);
        assert_eq!(obs.present["S1"].display_name.as_deref(), Some("Asha"));
        assert_eq!(obs.absent, roster(&["S2"]));
    }
}
