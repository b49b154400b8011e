//! rollcall-store — SQLite adapter for the attendance core.
//!
//! Holds enrolled identities (with their embeddings), the attendance ledger
//! keyed by (person, date, section, subject), and the manual override audit
//! log. Implements the core's [`GallerySource`](rollcall_core::GallerySource)
//! and [`AttendanceLedger`](rollcall_core::AttendanceLedger) seams.

pub mod db;
pub mod ledger;
pub mod overrides;
pub mod students;

pub use db::{Store, StoreError};
pub use overrides::{ManualOverride, OverrideLogEntry, OverrideLogFilter, OverrideOutcome};
