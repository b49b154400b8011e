use crate::gallery::Gallery;
use crate::types::{BoundingBox, Detection, Embedding, MatchResult};
use ndarray::ArrayView1;

/// Strategy for finding the closest gallery identity for a probe embedding.
pub trait Matcher {
    /// Best gallery row and its similarity, or `None` when nothing is comparable
    /// (empty gallery, zero probe, dimension mismatch).
    fn nearest(&self, probe: &Embedding, gallery: &Gallery) -> Option<(usize, f32)>;

    /// Match one probe, accepting the nearest row only if it reaches `threshold`.
    fn match_embedding(
        &self,
        query_index: usize,
        probe: &Embedding,
        bounding_box: BoundingBox,
        gallery: &Gallery,
        threshold: f32,
    ) -> MatchResult {
        match self.nearest(probe, gallery) {
            Some((row, similarity)) if similarity >= threshold => MatchResult {
                query_index,
                person_id: gallery.person_id(row).map(str::to_owned),
                display_name: gallery.display_name(row).map(str::to_owned),
                similarity,
                bounding_box,
            },
            Some((_, similarity)) => MatchResult::unknown(query_index, similarity, bounding_box),
            None => MatchResult::unknown(query_index, 0.0, bounding_box),
        }
    }

    /// Match every detection of one image independently.
    fn match_all(
        &self,
        detections: &[Detection],
        gallery: &Gallery,
        threshold: f32,
    ) -> Vec<MatchResult> {
        detections
            .iter()
            .enumerate()
            .map(|(i, d)| self.match_embedding(i, &d.embedding, d.bounding_box, gallery, threshold))
            .collect()
    }
}

/// Cosine similarity matcher over the gallery's normalized embedding matrix.
///
/// Scores every row with one matrix-vector product. Ties on the maximum go
/// to the lowest row index.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn nearest(&self, probe: &Embedding, gallery: &Gallery) -> Option<(usize, f32)> {
        if gallery.is_empty() {
            return None;
        }
        if probe.dim() != gallery.dim() {
            tracing::warn!(
                expected = gallery.dim(),
                got = probe.dim(),
                "probe embedding dimension does not match gallery"
            );
            return None;
        }
        if probe.norm() == 0.0 {
            return None;
        }

        let probe = probe.normalized();
        let scores = gallery.matrix().dot(&ArrayView1::from(&probe.values[..]));

        let mut best: Option<(usize, f32)> = None;
        for (row, &score) in scores.iter().enumerate() {
            let score = if score.is_finite() { score.clamp(-1.0, 1.0) } else { -1.0 };
            // Strict comparison keeps the earliest row on exact ties.
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((row, score));
            }
        }
        best
    }
}
