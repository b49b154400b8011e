use serde::{Deserialize, Serialize};

/// Integer bounding box for a detected face: `[x1, y1, x2, y2]` in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl From<[i32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [i32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// Face embedding vector (512-dimensional for ArcFace buffalo models).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Return an L2-normalized copy. A zero vector stays zero.
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding { values }
    }
}

/// One face reported by the external detection/embedding model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub embedding: Embedding,
    #[serde(rename = "bbox")]
    pub bounding_box: BoundingBox,
}

/// An enrolled person with their stored face embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Stable key, e.g. roll number.
    pub person_id: String,
    pub display_name: String,
    pub department: String,
    pub section: String,
    pub embedding: Embedding,
}

impl IdentityRecord {
    pub fn info(&self) -> StudentInfo {
        StudentInfo {
            person_id: self.person_id.clone(),
            display_name: self.display_name.clone(),
            department: self.department.clone(),
            section: self.section.clone(),
        }
    }
}

/// Roster/directory view of a student, without the embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentInfo {
    pub person_id: String,
    pub display_name: String,
    pub department: String,
    pub section: String,
}

/// Result of matching one query embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Position of the query within its batch.
    pub query_index: usize,
    /// Matched identity; `None` means "unknown".
    pub person_id: Option<String>,
    pub display_name: Option<String>,
    /// Cosine similarity of the best gallery row, in [-1, 1].
    pub similarity: f32,
    pub bounding_box: BoundingBox,
}

impl MatchResult {
    pub fn unknown(query_index: usize, similarity: f32, bounding_box: BoundingBox) -> Self {
        Self {
            query_index,
            person_id: None,
            display_name: None,
            similarity,
            bounding_box,
        }
    }

    pub fn is_known(&self) -> bool {
        self.person_id.is_some()
    }
}
