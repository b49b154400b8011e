//! Enrolled student records.

use crate::db::{Store, StoreError};
use chrono::Utc;
use rollcall_core::{Embedding, GalleryError, GallerySource, IdentityRecord, StudentInfo};
use rusqlite::{params, OptionalExtension};

impl Store {
    /// Store an enrolled identity. With `overwrite` an existing record for
    /// the same roll number is replaced (re-enrollment); otherwise it is
    /// rejected as a duplicate.
    pub fn enroll(&self, record: &IdentityRecord, overwrite: bool) -> Result<(), StoreError> {
        let conn = self.conn();
        let exists: Option<String> = conn
            .query_row(
                "SELECT person_id FROM students WHERE person_id = ?1",
                params![record.person_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() && !overwrite {
            return Err(StoreError::Duplicate(record.person_id.clone()));
        }

        let embedding = serde_json::to_string(&record.embedding)?;
        conn.execute(
            "INSERT INTO students (person_id, name, department, section, embedding, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(person_id) DO UPDATE SET
               name = excluded.name,
               department = excluded.department,
               section = excluded.section,
               embedding = excluded.embedding,
               registered_at = excluded.registered_at",
            params![
                record.person_id,
                record.display_name,
                record.department,
                record.section,
                embedding,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tracing::info!(
            person_id = %record.person_id,
            dim = record.embedding.dim(),
            reenrolled = exists.is_some(),
            "student enrolled"
        );
        Ok(())
    }

    /// Directory of all students, ordered by roll number.
    pub fn students(&self) -> Result<Vec<StudentInfo>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT person_id, name, department, section FROM students ORDER BY person_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(StudentInfo {
                person_id: row.get(0)?,
                display_name: row.get(1)?,
                department: row.get(2)?,
                section: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// All enrolled identities with embeddings, in enrollment-key order.
    pub fn identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT person_id, name, department, section, embedding
             FROM students WHERE model = 'arcface' ORDER BY person_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (person_id, display_name, department, section, embedding) = row?;
            let embedding: Embedding = serde_json::from_str(&embedding)?;
            records.push(IdentityRecord {
                person_id,
                display_name,
                department,
                section,
                embedding,
            });
        }
        Ok(records)
    }
}

impl GallerySource for Store {
    fn load_identities(&self) -> Result<Vec<IdentityRecord>, GalleryError> {
        self.identities()
            .map_err(|e| GalleryError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, section: &str) -> IdentityRecord {
        IdentityRecord {
            person_id: id.into(),
            display_name: format!("Student {id}"),
            department: "AIML".into(),
            section: section.into(),
            embedding: Embedding::new(vec![0.6, 0.8]),
        }
    }

    #[test]
    fn test_enroll_and_list() {
        let store = Store::open_in_memory().unwrap();
        store.enroll(&record("22B", "B"), false).unwrap();
        store.enroll(&record("21A", "A"), false).unwrap();

        let students = store.students().unwrap();
        assert_eq!(students.len(), 2);
        assert_eq!(students[0].person_id, "21A");

        let identities = store.identities().unwrap();
        assert_eq!(identities[1].embedding.values, vec![0.6, 0.8]);
    }

    #[test]
    fn test_duplicate_rejected_unless_overwrite() {
        let store = Store::open_in_memory().unwrap();
        store.enroll(&record("1", "A"), false).unwrap();
        assert!(matches!(store.enroll(&record("1", "B"), false), Err(StoreError::Duplicate(_))));

        store.enroll(&record("1", "B"), true).unwrap();
        let students = store.students().unwrap();
        assert_eq!(students.len(), 1);
        assert_eq!(students[0].section, "B");
    }

    #[test]
    fn test_gallery_source() {
        let store = Store::open_in_memory().unwrap();
        store.enroll(&record("1", "A"), false).unwrap();
        let loaded = store.load_identities().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].person_id, "1");
    }
}
