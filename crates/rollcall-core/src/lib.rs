//! rollcall-core — Attendance from face embeddings.
//!
//! Matches detector embeddings against an enrolled gallery, folds matches
//! from a batch of images into a per-session roster, and computes attendance
//! percentages over the resulting ledger facts.

pub mod analytics;
pub mod attendance;
pub mod enroll;
pub mod gallery;
pub mod matcher;
pub mod resolver;
pub mod session;
pub mod types;

pub use analytics::{AnalyticsEngine, AnalyticsError};
pub use attendance::{
    AttendanceFact, AttendanceLedger, AttendanceStatus, BulkUpsertReport, FactFilter, FactSource,
    LedgerError, MemoryLedger,
};
pub use enroll::{build_identity, EnrollError};
pub use gallery::{Gallery, GalleryCache, GalleryError, GallerySource};
pub use matcher::{CosineMatcher, Matcher};
pub use resolver::{
    EntityResolver, Resolution, ResolveStrategy, SectionKey, SubjectKey, SubjectMapping,
};
pub use session::{Session, SessionAggregator, SessionKey, SessionObservation};
pub use types::{BoundingBox, Detection, Embedding, IdentityRecord, MatchResult, StudentInfo};

/// Reference cosine similarity threshold for L2-normalized ArcFace embeddings.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.38;
