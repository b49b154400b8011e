//! Enrollment-time validation of detector output.

use crate::types::{Detection, Embedding, IdentityRecord, StudentInfo};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum EnrollError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces detected ({0}); enrollment photos must show exactly one face")]
    MultipleFacesDetected(usize),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("face embedding is empty or all zeros")]
    InvalidEmbedding,
}

/// Pick the single face of an enrollment photo and normalize its embedding.
pub fn enrollment_embedding(detections: &[Detection]) -> Result<Embedding, EnrollError> {
    let face = match detections {
        [] => return Err(EnrollError::NoFaceDetected),
        [face] => face,
        many => return Err(EnrollError::MultipleFacesDetected(many.len())),
    };
    if face.embedding.norm() == 0.0 {
        return Err(EnrollError::InvalidEmbedding);
    }
    Ok(face.embedding.normalized())
}

/// Build the identity record stored for a newly enrolled student.
pub fn build_identity(
    info: StudentInfo,
    detections: &[Detection],
) -> Result<IdentityRecord, EnrollError> {
    for (field, value) in [
        ("rollNo", &info.person_id),
        ("name", &info.display_name),
        ("department", &info.department),
        ("section", &info.section),
    ] {
        if value.trim().is_empty() {
            return Err(EnrollError::MissingField(field));
        }
    }

    let embedding = enrollment_embedding(detections)?;
    Ok(IdentityRecord {
        person_id: info.person_id.trim().to_string(),
        display_name: info.display_name.trim().to_string(),
        department: info.department.trim().to_string(),
        section: info.section.trim().to_string(),
        embedding,
    })
}
