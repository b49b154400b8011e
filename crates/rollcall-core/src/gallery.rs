//! Enrolled-identity gallery and its refreshable cache.
//!
//! The gallery is an immutable snapshot: parallel person-id / display-name
//! sequences plus an N×D matrix of L2-normalized embeddings. [`GalleryCache`]
//! builds it from a [`GallerySource`] once and hands out shared snapshots
//! until [`GalleryCache::invalidate`] is called.

use crate::types::IdentityRecord;
use ndarray::{Array2, ArrayView1};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery unavailable: {0}")]
    Unavailable(String),
    #[error("embedding matrix shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Anything that can enumerate enrolled identities (the document store).
pub trait GallerySource {
    fn load_identities(&self) -> Result<Vec<IdentityRecord>, GalleryError>;
}

impl<S: GallerySource + ?Sized> GallerySource for Arc<S> {
    fn load_identities(&self) -> Result<Vec<IdentityRecord>, GalleryError> {
        (**self).load_identities()
    }
}

/// Immutable snapshot of enrolled embeddings.
///
/// Rows are in source order. A person may own several rows (one per stored
/// embedding); arg-max matching over rows then yields best-of-N per person.
#[derive(Debug, Clone)]
pub struct Gallery {
    person_ids: Vec<String>,
    display_names: Vec<String>,
    matrix: Array2<f32>,
}

impl Gallery {
    pub fn empty() -> Self {
        Self {
            person_ids: Vec::new(),
            display_names: Vec::new(),
            matrix: Array2::zeros((0, 0)),
        }
    }

    /// Build a snapshot, normalizing every embedding.
    ///
    /// The first usable record fixes the dimensionality. Records with a
    /// different length, or with a zero vector, are skipped and logged.
    pub fn from_records(records: &[IdentityRecord]) -> Result<Self, GalleryError> {
        let mut dim: Option<usize> = None;
        let mut person_ids = Vec::with_capacity(records.len());
        let mut display_names = Vec::with_capacity(records.len());
        let mut data = Vec::new();

        for record in records {
            if record.embedding.norm() == 0.0 {
                tracing::warn!(person_id = %record.person_id, "rejecting empty or zero embedding");
                continue;
            }
            let expected = *dim.get_or_insert(record.embedding.dim());
            if record.embedding.dim() != expected {
                tracing::warn!(
                    person_id = %record.person_id,
                    expected,
                    got = record.embedding.dim(),
                    "rejecting identity with mismatched embedding dimension"
                );
                continue;
            }

            person_ids.push(record.person_id.clone());
            display_names.push(record.display_name.clone());
            data.extend(record.embedding.normalized().values);
        }

        let rows = person_ids.len();
        let matrix = Array2::from_shape_vec((rows, dim.unwrap_or(0)), data)?;

        Ok(Self {
            person_ids,
            display_names,
            matrix,
        })
    }

    pub fn len(&self) -> usize {
        self.person_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.person_ids.is_empty()
    }

    /// Embedding dimensionality, 0 for an empty gallery.
    pub fn dim(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn person_ids(&self) -> &[String] {
        &self.person_ids
    }

    pub fn person_id(&self, row: usize) -> Option<&str> {
        self.person_ids.get(row).map(String::as_str)
    }

    pub fn display_name(&self, row: usize) -> Option<&str> {
        self.display_names.get(row).map(String::as_str)
    }

    pub fn matrix(&self) -> &Array2<f32> {
        &self.matrix
    }

    pub fn row(&self, row: usize) -> ArrayView1<'_, f32> {
        self.matrix.row(row)
    }
}

#[derive(Default)]
struct CacheState {
    snapshot: Option<Arc<Gallery>>,
    stale: bool,
    /// Bumped by every `invalidate()`.
    generation: u64,
}

/// Load-once, refresh-on-demand gallery owned by the service root.
///
/// Concurrent `load()` calls coalesce: one caller rebuilds while the others
/// wait on the rebuild lock and then pick up its result. After
/// [`invalidate`](Self::invalidate) the old snapshot is kept as a fallback
/// and served if the next rebuild cannot reach the store.
pub struct GalleryCache<S> {
    source: S,
    state: RwLock<CacheState>,
    rebuild: Mutex<()>,
}

impl<S: GallerySource> GalleryCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: RwLock::new(CacheState::default()),
            rebuild: Mutex::new(()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Return the current snapshot, rebuilding it from the source if needed.
    pub fn load(&self) -> Result<Arc<Gallery>, GalleryError> {
        if let Some(gallery) = self.fresh() {
            return Ok(gallery);
        }

        let _guard = self.rebuild.lock().unwrap_or_else(PoisonError::into_inner);

        // Another caller may have finished the rebuild while we waited.
        if let Some(gallery) = self.fresh() {
            return Ok(gallery);
        }

        let generation = self.state.read().unwrap_or_else(PoisonError::into_inner).generation;
        let rebuilt = self
            .source
            .load_identities()
            .and_then(|records| Gallery::from_records(&records));

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match rebuilt {
            Ok(gallery) => {
                tracing::info!(
                    identities = gallery.len(),
                    dim = gallery.dim(),
                    "gallery loaded"
                );
                let gallery = Arc::new(gallery);
                state.snapshot = Some(Arc::clone(&gallery));
                // An invalidate() during the read means this snapshot may already be out of date.
                state.stale = state.generation != generation;
                Ok(gallery)
            }
            Err(err) => match &state.snapshot {
                Some(previous) => {
                    tracing::warn!(error = %err, "gallery rebuild failed; serving stale snapshot");
                    Ok(Arc::clone(previous))
                }
                None => Err(err),
            },
        }
    }

    /// Mark the snapshot stale; the next `load()` rebuilds it.
    pub fn invalidate(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.stale = true;
        state.generation += 1;
        tracing::debug!(generation = state.generation, "gallery invalidated");
    }

    fn fresh(&self) -> Option<Arc<Gallery>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match &state.snapshot {
            Some(gallery) if !state.stale => Some(Arc::clone(gallery)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Embedding;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::time::Duration;

    fn record(id: &str, values: Vec<f32>) -> IdentityRecord {
        IdentityRecord {
            person_id: id.into(),
            display_name: format!("Student {id}"),
            department: "AIML".into(),
            section: "B".into(),
            embedding: Embedding::new(values),
        }
    }

    struct CountingSource {
        loads: AtomicUsize,
        offline: AtomicBool,
        records: Vec<IdentityRecord>,
    }

    impl CountingSource {
        fn new(records: Vec<IdentityRecord>) -> Self {
            Self {
                loads: AtomicUsize::new(0),
                offline: AtomicBool::new(false),
                records,
            }
        }
    }

    impl GallerySource for CountingSource {
        fn load_identities(&self) -> Result<Vec<IdentityRecord>, GalleryError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            if self.offline.load(Ordering::SeqCst) {
                return Err(GalleryError::Unavailable("connection refused".into()));
            }
            Ok(self.records.clone())
        }
    }

    #[test]
    fn test_from_records_normalizes_rows() {
        let gallery = Gallery::from_records(&[record("1", vec![3.0, 4.0])]).unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.dim(), 2);
        assert!((gallery.row(0)[0] - 0.6).abs() < 1e-6);
        assert!((gallery.row(0)[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_from_records_rejects_mismatched_dimension() {
        let gallery = Gallery::from_records(&[
            record("1", vec![1.0, 0.0]),
            record("2", vec![1.0, 0.0, 0.0]),
            record("3", vec![0.0, 1.0]),
        ])
        .unwrap();
        assert_eq!(gallery.person_ids(), &["1".to_string(), "3".to_string()]);
        assert_eq!(gallery.display_name(1), Some("Student 3"));
    }

    #[test]
    fn test_from_records_empty() {
        let gallery = Gallery::from_records(&[]).unwrap();
        assert!(gallery.is_empty());
        assert_eq!(gallery.dim(), 0);
    }

    #[test]
    fn test_load_is_cached_until_invalidated() {
        let cache = GalleryCache::new(CountingSource::new(vec![record("1", vec![1.0, 0.0])]));
        let a = cache.load().unwrap();
        let b = cache.load().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.source().loads.load(Ordering::SeqCst), 1);

        cache.invalidate();
        let c = cache.load().unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.source().loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_loads_coalesce() {
        let cache = GalleryCache::new(CountingSource::new(vec![record("1", vec![1.0, 0.0])]));
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let gallery = cache.load().unwrap();
                    assert_eq!(gallery.len(), 1);
                });
            }
        });
        assert_eq!(cache.source().loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unavailable_without_snapshot_propagates() {
        let source = CountingSource::new(vec![]);
        source.offline.store(true, Ordering::SeqCst);
        let cache = GalleryCache::new(source);
        assert!(matches!(cache.load(), Err(GalleryError::Unavailable(_))));
    }

    #[test]
    fn test_unavailable_serves_stale_snapshot() {
        let cache = GalleryCache::new(CountingSource::new(vec![record("1", vec![1.0, 0.0])]));
        let first = cache.load().unwrap();

        cache.source().offline.store(true, Ordering::SeqCst);
        cache.invalidate();
        let stale = cache.load().unwrap();
        assert!(Arc::ptr_eq(&first, &stale));

        cache.source().offline.store(false, Ordering::SeqCst);
        let rebuilt = cache.load().unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
    }

    /// Source that signals once it has read its records and then blocks
    /// until released, so a test can act in the middle of a rebuild.
    struct GatedSource {
        records: Mutex<Vec<IdentityRecord>>,
        gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    }

    impl GallerySource for GatedSource {
        fn load_identities(&self) -> Result<Vec<IdentityRecord>, GalleryError> {
            let records = self.records.lock().unwrap().clone();
            if let Some((read, release)) = self.gate.lock().unwrap().take() {
                read.send(()).unwrap();
                release.recv().unwrap();
            }
            Ok(records)
        }
    }

    #[test]
    fn test_invalidate_during_rebuild_is_not_lost() {
        let (read_tx, read_rx) = channel();
        let (release_tx, release_rx) = channel();
        let cache = GalleryCache::new(GatedSource {
            records: Mutex::new(vec![record("S1", vec![1.0, 0.0])]),
            gate: Mutex::new(Some((read_tx, release_rx))),
        });

        let first = std::thread::scope(|s| {
            let rebuild = s.spawn(|| cache.load().unwrap());
            read_rx.recv().unwrap();
            cache.source().records.lock().unwrap().push(record("S2", vec![0.0, 1.0]));
            cache.invalidate();
            release_tx.send(()).unwrap();
            rebuild.join().unwrap()
        });
        assert_eq!(first.person_ids(), &["S1".to_string()]);

        let next = cache.load().unwrap();
        assert_eq!(next.person_ids(), &["S1".to_string(), "S2".to_string()]);
    }
}
