//! # VectorStore
//!
//! Exact cosine-similarity search over a small, mostly static set of [`EmbeddingRecord`]s.
//!
//! ## Responsibilities
//! - **Ranking**: [`VectorIndex::search`] scores every record against the query vector,
//!   drops scores under `min_similarity`, and returns at most `top_k` hits in descending
//!   score order. Equal scores keep insertion order.
//! - **Persistence**: the whole index is one JSON snapshot written with
//!   [`crate::persist::write_json_atomic`], so a failed rebuild never clobbers the previous file.
//! - **Load state**: [`VectorIndex::load`] returns an [`IndexState`]; a missing or malformed file
//!   is [`IndexState::NotBuilt`], which is not the same thing as a valid empty index.
//! - **Sharing**: [`IndexHandle`] hands out `Arc` snapshots. A rebuild swaps the snapshot; readers
//!   keep whatever snapshot they already hold.
//!
//! The scan is linear and is meant for indexes below roughly 100k records. Anything that can
//! answer [`SimilaritySearch`] can stand in for it later (an HNSW graph, for instance).
//!
//! ## Snapshot layout
//! ```json
//! {
//!   "version": 1,
//!   "model": "deepseek-embedding",
//!   "dimension": 3,
//!   "records": [
//!     { "id": "c1", "label": "Laptops", "sourceUrl": "https://...", "vector": [0.1, 0.2, 0.3],
//!       "createdAt": "...", "updatedAt": "...", "contentHash": "..." }
//!   ]
//! }
//! ```
//!
//! ## Quick Example
//! ```no_run
//! use shopscope::vector_store::{IndexState, SimilaritySearch, VectorIndex};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let state = VectorIndex::load("data/vectorized_categories.json".as_ref());
//! let index = state.ready()?;
//! for hit in index.search(&[0.1, 0.7, 0.2], 5, 0.0)? {
//!     println!("{} {:.3}", hit.record.label, hit.score);
//! }
//! # Ok(()) }
//! ```

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::SystemTime,
};
use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    models::EmbeddingRecord,
    persist,
};

/// Largest `top_k` a search accepts. Larger requests are rejected, not clamped.
pub const MAX_TOP_K: i64 = 50;

/// Snapshot format version written by [`VectorIndex::save`].
pub const SNAPSHOT_VERSION: u32 = 1;

/// Below this many records the scan stays on the calling thread.
const PARALLEL_SCAN_THRESHOLD: usize = 2048;

/// Cosine similarity `dot(a, b) / (|a| * |b|)`.
///
/// Returns `0.0` when either vector has zero norm (or the arithmetic produces NaN), and clamps
/// the result into `[-1, 1]` to absorb rounding. Callers are expected to pass equal-length
/// slices; extra trailing components of the longer slice are ignored.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    if score.is_nan() {
        0.0
    } else {
        score.clamp(-1.0, 1.0)
    }
}

/// One ranked result, borrowed from the index that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit<'a> {
    pub record: &'a EmbeddingRecord,
    pub score: f64,
}

/// Anything that can answer a top-k similarity query.
pub trait SimilaritySearch: Send + Sync {
    /// Vector length every query must have (0 for an empty index).
    fn dimension(&self) -> usize;

    /// Number of searchable records.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rank records by similarity to `query`.
    ///
    /// # Errors
    /// - [`Error::InvalidInput`] if `top_k > MAX_TOP_K`, `min_similarity` is not finite, or the
    ///   query length differs from [`dimension`](Self::dimension).
    fn search(&self, query: &[f64], top_k: i64, min_similarity: f64) -> Result<Vec<SearchHit<'_>>>;
}

/// Check the caller-controlled search knobs.
pub fn validate_search_params(top_k: i64, min_similarity: f64) -> Result<()> {
    if top_k > MAX_TOP_K {
        return Err(Error::invalid_input(format!(
            "topK must be at most {MAX_TOP_K}, got {top_k}"
        )));
    }
    if !min_similarity.is_finite() {
        return Err(Error::invalid_input("minSimilarity must be a finite number"));
    }
    Ok(())
}

/// An ordered set of embedding records sharing one dimensionality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorIndex {
    version: u32,
    model: String,
    dimension: usize,
    records: Vec<EmbeddingRecord>,
}

impl VectorIndex {
    /// An empty, valid index for vectors produced by `model`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            model: model.into(),
            dimension: 0,
            records: Vec::new(),
        }
    }

    /// Build an index from records, checking ids and dimensionality.
    pub fn from_records(model: impl Into<String>, records: Vec<EmbeddingRecord>) -> Result<Self> {
        let mut index = Self::new(model);
        for record in records {
            index.push(record)?;
        }
        Ok(index)
    }

    /// Append a record.
    ///
    /// # Errors
    /// [`Error::InvalidInput`] on a duplicate id, an empty vector, or a vector whose length
    /// differs from the records already present.
    pub fn push(&mut self, record: EmbeddingRecord) -> Result<()> {
        if record.vector.is_empty() {
            return Err(Error::invalid_input(format!(
                "record {} has an empty vector",
                record.id
            )));
        }
        if self.records.is_empty() {
            self.dimension = record.vector.len();
        } else if record.vector.len() != self.dimension {
            return Err(Error::invalid_input(format!(
                "record {} has dimension {}, index has {}",
                record.id,
                record.vector.len(),
                self.dimension
            )));
        }
        if self.records.iter().any(|r| r.id == record.id) {
            return Err(Error::invalid_input(format!(
                "duplicate record id {}",
                record.id
            )));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&EmbeddingRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Load a snapshot. Never fails: problems become [`IndexState::NotBuilt`].
    pub fn load(path: &Path) -> IndexState {
        match persist::read_json::<VectorIndex>(path) {
            Ok(None) => IndexState::NotBuilt {
                reason: format!("no index file at {}", path.display()),
            },
            Ok(Some(index)) => match index.validate() {
                Ok(()) => {
                    info!(
                        "Loaded vector index {} ({} records, dimension {})",
                        path.display(),
                        index.records.len(),
                        index.dimension
                    );
                    IndexState::Ready(index)
                }
                Err(e) => {
                    warn!("Rejecting vector index {}: {}", path.display(), e);
                    IndexState::NotBuilt {
                        reason: e.to_string(),
                    }
                }
            },
            Err(e) => {
                warn!("Unreadable vector index {}: {}", path.display(), e);
                IndexState::NotBuilt {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Atomically replace the snapshot at `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        persist::write_json_atomic(path, self)?;
        info!(
            "Saved vector index {} ({} records)",
            path.display(),
            self.records.len()
        );
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(Error::invalid_input(format!(
                "unsupported snapshot version {}",
                self.version
            )));
        }
        let mut seen = HashSet::with_capacity(self.records.len());
        for record in &self.records {
            if record.vector.len() != self.dimension || record.vector.is_empty() {
                return Err(Error::invalid_input(format!(
                    "record {} has dimension {}, index declares {}",
                    record.id,
                    record.vector.len(),
                    self.dimension
                )));
            }
            if !seen.insert(record.id.as_str()) {
                return Err(Error::invalid_input(format!(
                    "duplicate record id {}",
                    record.id
                )));
            }
        }
        Ok(())
    }
}

impl SimilaritySearch for VectorIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn search(&self, query: &[f64], top_k: i64, min_similarity: f64) -> Result<Vec<SearchHit<'_>>> {
        validate_search_params(top_k, min_similarity)?;
        if top_k <= 0 || self.records.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(Error::invalid_input(format!(
                "query has dimension {}, index has {}",
                query.len(),
                self.dimension
            )));
        }

        let score = |record: &EmbeddingRecord| cosine_similarity(query, &record.vector);
        // Collected in record order, so the stable sort below breaks ties by insertion.
        let mut hits: Vec<SearchHit<'_>> = if self.records.len() >= PARALLEL_SCAN_THRESHOLD {
            self.records
                .par_iter()
                .map(|record| SearchHit {
                    record,
                    score: score(record),
                })
                .filter(|hit| hit.score >= min_similarity)
                .collect()
        } else {
            self.records
                .iter()
                .map(|record| SearchHit {
                    record,
                    score: score(record),
                })
                .filter(|hit| hit.score >= min_similarity)
                .collect()
        };

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(top_k as usize);
        Ok(hits)
    }
}

/// Result of loading a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexState {
    Ready(VectorIndex),
    /// No usable snapshot: missing file, malformed JSON, or inconsistent records.
    NotBuilt { reason: String },
}

impl IndexState {
    /// Borrow the index, or fail with [`Error::IndexNotBuilt`].
    pub fn ready(&self) -> Result<&VectorIndex> {
        match self {
            IndexState::Ready(index) => Ok(index),
            IndexState::NotBuilt { reason } => Err(Error::index_not_built(reason.clone())),
        }
    }

    pub fn is_built(&self) -> bool {
        matches!(self, IndexState::Ready(_))
    }
}

/// The served index: a file path plus the snapshot currently loaded from it.
///
/// Readers call [`snapshot`](Self::snapshot) and search their own `Arc` without holding any lock.
/// [`current`](Self::current) additionally reloads when the file changed on disk since it was
/// loaded, so writes made by another process are picked up.
#[derive(Debug)]
pub struct IndexHandle {
    path: PathBuf,
    current: RwLock<Loaded>,
}

#[derive(Debug, Clone)]
struct Loaded {
    state: Arc<IndexState>,
    modified: Option<SystemTime>,
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl IndexHandle {
    /// Load `path` and wrap the result.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let modified = modified_at(&path);
        let state = VectorIndex::load(&path);
        Self {
            path,
            current: RwLock::new(Loaded {
                state: Arc::new(state),
                modified,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The loaded snapshot, without looking at the file.
    pub fn snapshot(&self) -> Arc<IndexState> {
        self.loaded().state
    }

    /// The loaded snapshot, reloaded first if the file's modification time moved.
    pub fn current(&self) -> Arc<IndexState> {
        let loaded = self.loaded();
        if modified_at(&self.path) == loaded.modified {
            return loaded.state;
        }
        info!("Vector index {} changed on disk, reloading", self.path.display());
        self.reload()
    }

    /// Install a freshly built index (already saved by the caller).
    pub fn replace(&self, index: VectorIndex) {
        let modified = modified_at(&self.path);
        self.install(IndexState::Ready(index), modified);
    }

    /// Re-read the file, picking up writes made by someone else.
    pub fn reload(&self) -> Arc<IndexState> {
        let modified = modified_at(&self.path);
        let state = VectorIndex::load(&self.path);
        self.install(state, modified);
        self.snapshot()
    }

    fn loaded(&self) -> Loaded {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn install(&self, state: IndexState, modified: Option<SystemTime>) {
        let loaded = Loaded {
            state: Arc::new(state),
            modified,
        };
        match self.current.write() {
            Ok(mut guard) => *guard = loaded,
            Err(poisoned) => *poisoned.into_inner() = loaded,
        }
    }
}
