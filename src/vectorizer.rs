//! # Vectorizer
//!
//! Builds a [`VectorIndex`] from source rows while spending as few embedding calls as possible.
//!
//! ## Cache by content hash
//! Each row's embedding text is normalized (trimmed, internal whitespace collapsed) and hashed
//! with blake3 together with the embedding model name. A row whose hash already appears in the
//! previous index reuses that vector, so re-running over unchanged input makes **zero** provider
//! calls and writes a byte-identical snapshot. Rows that share a text within one run share one
//! embedding as well.
//!
//! ## Batches, retries, partial success
//! Texts that need embedding are sent in batches of `batch_size`. A batch failing with a
//! retryable error (timeout, transport, 429, 5xx) is retried with exponential backoff up to
//! [`RetryPolicy::attempts`] times. A batch failing with a non-retryable error is split and its
//! items are embedded one at a time, so one bad item only fails itself. Whatever still fails is
//! recorded in [`VectorizeSummary::errors`]; the rest of the run carries on.
//!
//! ## Saving
//! [`Vectorizer::vectorize_file`] writes through [`VectorIndex::save`], which replaces the file
//! atomically. A run in which nothing succeeded (but something failed) does not touch the
//! previous snapshot.

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    embedding::EmbeddingProvider,
    error::{Error, Result},
    models::EmbeddingRecord,
    source::{self, SourceRow},
    vector_store::{IndexState, VectorIndex},
};

/// How often and how patiently to retry a failed embedding batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first. Zero behaves like one.
    pub attempts: u32,
    /// Delay before the second attempt; doubles for every further attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`: `base_delay * 2^(attempt - 1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// One row that did not make it into the index.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub id: Option<String>,
    pub message: String,
}

/// What a vectorize run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorizeSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<ItemError>,
    /// Rows served from the hash cache.
    pub reused: usize,
    /// Calls made to the embedding provider, retries included.
    pub provider_calls: usize,
}

impl VectorizeSummary {
    fn fail(&mut self, id: Option<String>, message: impl Into<String>) {
        self.failed += 1;
        self.errors.push(ItemError {
            id,
            message: message.into(),
        });
    }
}

#[derive(Debug)]
pub struct VectorizeOutcome {
    pub index: VectorIndex,
    pub summary: VectorizeSummary,
    /// First provider error seen, kept so a run with no successes can report it.
    pub first_failure: Option<Error>,
}

/// Stable cache key for a text under a given embedding model.
pub fn content_hash(model: &str, text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = blake3::Hasher::new();
    hasher.update(model.as_bytes());
    hasher.update(b"\n");
    hasher.update(normalized.as_bytes());
    hasher.finalize().to_hex().to_string()
}

pub struct Vectorizer {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl Vectorizer {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
            retry,
        }
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Build a new index for `rows`, reusing vectors from `existing` where the content hash
    /// matches. Nothing is written to disk.
    pub async fn vectorize(
        &self,
        rows: &[SourceRow],
        existing: Option<&VectorIndex>,
    ) -> Result<VectorizeOutcome> {
        let model = self.provider.model().to_string();
        let mut summary = VectorizeSummary::default();

        let mut cache: HashMap<&str, &EmbeddingRecord> = HashMap::new();
        let mut previous_by_id: HashMap<&str, &EmbeddingRecord> = HashMap::new();
        if let Some(existing) = existing {
            for record in existing.records() {
                cache.entry(record.content_hash.as_str()).or_insert(record);
                previous_by_id.insert(record.id.as_str(), record);
            }
        }

        // Work out which rows need the provider, deduplicating identical texts.
        let mut seen_ids = HashSet::new();
        let mut planned: Vec<(&SourceRow, String)> = Vec::with_capacity(rows.len());
        let mut pending: Vec<(String, String)> = Vec::new();
        let mut pending_hashes = HashSet::new();
        for row in rows {
            if !seen_ids.insert(row.id.as_str()) {
                summary.fail(Some(row.id.clone()), format!("duplicate id on line {}", row.line));
                continue;
            }
            let text = row.embedding_text();
            let hash = content_hash(&model, &text);
            if !cache.contains_key(hash.as_str()) && pending_hashes.insert(hash.clone()) {
                pending.push((hash.clone(), text));
            }
            planned.push((row, hash));
        }

        info!(
            "Vectorizing {} rows, {} distinct texts to embed",
            planned.len(),
            pending.len()
        );

        let calls = AtomicUsize::new(0);
        let mut fresh: HashMap<String, Vec<f64>> = HashMap::new();
        let mut failures: HashMap<String, String> = HashMap::new();
        let mut first_failure = None;
        for batch in pending.chunks(self.batch_size) {
            for (hash, result) in self.embed_batch(batch, &calls).await {
                match result {
                    Ok(vector) => {
                        fresh.insert(hash, vector);
                    }
                    Err(e) => {
                        failures.insert(hash, e.to_string());
                        first_failure.get_or_insert(e);
                    }
                }
            }
        }
        summary.provider_calls = calls.load(Ordering::SeqCst);

        let now = Utc::now();
        let mut index = VectorIndex::new(model);
        for (row, hash) in planned {
            let previous = previous_by_id.get(row.id.as_str()).copied();
            let (vector, reused) = if let Some(cached) = cache.get(hash.as_str()) {
                (cached.vector.clone(), true)
            } else if let Some(vector) = fresh.get(&hash) {
                (vector.clone(), false)
            } else {
                let message = failures
                    .get(&hash)
                    .cloned()
                    .unwrap_or_else(|| "no embedding returned".to_string());
                summary.fail(Some(row.id.clone()), message);
                continue;
            };

            let unchanged = previous.filter(|p| p.content_hash == hash);
            let record = EmbeddingRecord {
                id: row.id.clone(),
                label: row.name.clone(),
                source_url: row.source_url.clone(),
                vector,
                created_at: row
                    .created_at
                    .or(previous.map(|p| p.created_at))
                    .unwrap_or(now),
                updated_at: row
                    .updated_at
                    .or(unchanged.map(|p| p.updated_at))
                    .unwrap_or(now),
                content_hash: hash,
            };
            match index.push(record) {
                Ok(()) => {
                    summary.succeeded += 1;
                    if reused {
                        summary.reused += 1;
                    }
                }
                Err(e) => summary.fail(Some(row.id.clone()), e.to_string()),
            }
        }

        info!(
            "Vectorized: {} succeeded ({} reused), {} failed, {} provider calls",
            summary.succeeded, summary.reused, summary.failed, summary.provider_calls
        );
        Ok(VectorizeOutcome {
            index,
            summary,
            first_failure,
        })
    }

    /// Read `source`, reuse whatever index already sits at `output`, and atomically write the
    /// new index there.
    ///
    /// # Errors
    /// - Source read/parse errors ([`Error::InvalidInput`], [`Error::PersistenceFailure`]).
    /// - The first provider error when rows existed but none could be vectorized; the previous
    ///   snapshot is left in place.
    /// - [`Error::PersistenceFailure`] if the snapshot cannot be written.
    pub async fn vectorize_file(&self, source: &Path, output: &Path) -> Result<VectorizeOutcome> {
        let table = source::read_source(source)?;
        let previous = VectorIndex::load(output);
        if let IndexState::NotBuilt { reason } = &previous {
            debug!("Starting without a reusable index: {}", reason);
        }
        let existing = match &previous {
            IndexState::Ready(index) => Some(index),
            IndexState::NotBuilt { .. } => None,
        };

        let mut outcome = self.vectorize(&table.rows, existing).await?;
        for rejected in table.rejected {
            outcome.summary.fail(
                rejected.id,
                format!("line {}: {}", rejected.line, rejected.message),
            );
        }

        if outcome.summary.succeeded == 0 && outcome.summary.failed > 0 {
            warn!(
                "No rows vectorized from {}; keeping {}",
                source.display(),
                output.display()
            );
            return Err(outcome.first_failure.take().unwrap_or_else(|| {
                Error::invalid_input(format!("no usable rows in {}", source.display()))
            }));
        }

        outcome.index.save(output)?;
        Ok(outcome)
    }

    /// Embed one batch. Returns one result per `(hash, text)` input.
    async fn embed_batch(
        &self,
        batch: &[(String, String)],
        calls: &AtomicUsize,
    ) -> Vec<(String, Result<Vec<f64>>)> {
        let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
        match self.embed_with_retry(&texts, calls).await {
            Ok(vectors) => batch
                .iter()
                .map(|(hash, _)| hash.clone())
                .zip(vectors.into_iter().map(Ok))
                .collect(),
            Err(e) if !e.is_retryable() && batch.len() > 1 => {
                warn!(
                    "Batch of {} failed ({}); embedding items one by one",
                    batch.len(),
                    e
                );
                let singles = batch.iter().map(|(hash, text)| async move {
                    let result = self
                        .embed_with_retry(std::slice::from_ref(text), calls)
                        .await
                        .and_then(|mut vectors| {
                            vectors.pop().ok_or_else(|| {
                                Error::invalid_input("provider returned no embedding")
                            })
                        });
                    (hash.clone(), result)
                });
                join_all(singles).await
            }
            Err(e) => batch
                .iter()
                .map(|(hash, _)| (hash.clone(), Err(e.clone())))
                .collect(),
        }
    }

    async fn embed_with_retry(&self, texts: &[String], calls: &AtomicUsize) -> Result<Vec<Vec<f64>>> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            calls.fetch_add(1, Ordering::SeqCst);
            match self.provider.embed_batch(texts).await {
                Ok(vectors) if vectors.len() == texts.len() => return Ok(vectors),
                Ok(vectors) => {
                    return Err(Error::invalid_input(format!(
                        "provider returned {} embeddings for {} texts",
                        vectors.len(),
                        texts.len()
                    )));
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        "Embedding attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ProviderErrorKind, vector_store::SimilaritySearch};
    use async_trait::async_trait;
    use std::{fs, sync::Mutex};
    use tempfile::TempDir;

    fn setup() {
        let _ = tracing_subscriber::fmt::try_init();
    }

    /// Deterministic fake: vectors derive from the text, failures are scripted.
    #[derive(Default)]
    struct ScriptedProvider {
        calls: AtomicUsize,
        batches: Mutex<Vec<Vec<String>>>,
        transient_failures: AtomicUsize,
        reject_containing: Option<&'static str>,
    }

    impl ScriptedProvider {
        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().unwrap().push(texts.to_vec());
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::provider(ProviderErrorKind::Status(503), "busy"));
            }
            if let Some(bad) = self.reject_containing {
                if texts.iter().any(|t| t.contains(bad)) {
                    return Err(Error::provider(ProviderErrorKind::Status(400), "bad input"));
                }
            }
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("short") {
                        vec![1.0, 2.0]
                    } else {
                        vec![t.len() as f64, t.matches('a').count() as f64 + 1.0, 1.0]
                    }
                })
                .collect())
        }
    }

    fn rows(n: usize) -> Vec<SourceRow> {
        (0..n)
            .map(|i| SourceRow::new(format!("c-{i}"), format!("Category {i}"), format!("https://shop/{i}")))
            .collect()
    }

    fn vectorizer(provider: Arc<ScriptedProvider>, batch_size: usize) -> Vectorizer {
        Vectorizer::new(
            provider,
            batch_size,
            RetryPolicy {
                attempts: 3,
                base_delay: Duration::ZERO,
            },
        )
    }

    #[test]
    fn test_content_hash_normalizes_whitespace_and_includes_model() {
        assert_eq!(
            content_hash("m", "  Laptops   https://x "),
            content_hash("m", "Laptops https://x")
        );
        assert_ne!(content_hash("m", "Laptops"), content_hash("other", "Laptops"));
        assert_ne!(content_hash("m", "Laptops"), content_hash("m", "Laptop"));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            attempts: 4,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_batches_respect_batch_size() {
        setup();
        let provider = Arc::new(ScriptedProvider::default());
        let outcome = vectorizer(provider.clone(), 10).vectorize(&rows(25), None).await.unwrap();

        assert_eq!(outcome.summary.succeeded, 25);
        assert_eq!(outcome.summary.failed, 0);
        let sizes: Vec<usize> = provider.batches().iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(outcome.index.len(), 25);
        assert_eq!(outcome.index.records()[0].id, "c-0");
    }

    #[tokio::test]
    async fn test_unchanged_rows_make_no_calls_and_identical_snapshot() {
        setup();
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("categories.csv");
        let output = dir.path().join("index.json");
        fs::write(
            &source,
            "id,name,source_url\nc-1,Laptops,https://shop/laptops\nc-2,Phones,https://shop/phones\n",
        )
        .unwrap();

        let provider = Arc::new(ScriptedProvider::default());
        let v = vectorizer(provider.clone(), 10);
        v.vectorize_file(&source, &output).await.unwrap();
        let first_bytes = fs::read(&output).unwrap();
        let calls_after_first = provider.calls.load(Ordering::SeqCst);
        assert_eq!(calls_after_first, 1);

        let second = v.vectorize_file(&source, &output).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), calls_after_first);
        assert_eq!(second.summary.provider_calls, 0);
        assert_eq!(second.summary.reused, 2);
        assert_eq!(fs::read(&output).unwrap(), first_bytes);
    }

    #[tokio::test]
    async fn test_only_changed_rows_are_embedded() {
        setup();
        let provider = Arc::new(ScriptedProvider::default());
        let v = vectorizer(provider.clone(), 10);
        let mut input = rows(3);
        let first = v.vectorize(&input, None).await.unwrap();

        input[1].name = "Renamed".to_string();
        let second = v.vectorize(&input, Some(&first.index)).await.unwrap();

        assert_eq!(second.summary.succeeded, 3);
        assert_eq!(second.summary.reused, 2);
        let batches = provider.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1], vec!["Renamed https://shop/1".to_string()]);
        assert_eq!(second.index.records()[0].updated_at, first.index.records()[0].updated_at);
        assert_eq!(second.index.records()[1].created_at, first.index.records()[1].created_at);
    }

    #[tokio::test]
    async fn test_identical_texts_share_one_embedding() {
        let provider = Arc::new(ScriptedProvider::default());
        let input = vec![
            SourceRow::new("a", "Cameras", ""),
            SourceRow::new("b", "Cameras", ""),
        ];
        let outcome = vectorizer(provider.clone(), 10).vectorize(&input, None).await.unwrap();
        assert_eq!(outcome.summary.succeeded, 2);
        assert_eq!(provider.batches(), vec![vec!["Cameras".to_string()]]);
    }

    #[tokio::test]
    async fn test_bad_item_fails_alone() {
        setup();
        let provider = Arc::new(ScriptedProvider {
            reject_containing: Some("Poison"),
            ..Default::default()
        });
        let mut input = rows(4);
        input[2].name = "Poison".to_string();
        let outcome = vectorizer(provider.clone(), 10).vectorize(&input, None).await.unwrap();

        assert_eq!(outcome.summary.succeeded, 3);
        assert_eq!(outcome.summary.failed, 1);
        assert_eq!(outcome.summary.errors[0].id.as_deref(), Some("c-2"));
        assert!(outcome.index.get("c-2").is_none());
        // one failed batch + four single-item calls
        assert_eq!(outcome.summary.provider_calls, 5);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        setup();
        let provider = Arc::new(ScriptedProvider {
            transient_failures: AtomicUsize::new(2),
            ..Default::default()
        });
        let outcome = vectorizer(provider.clone(), 10).vectorize(&rows(3), None).await.unwrap();
        assert_eq!(outcome.summary.succeeded, 3);
        assert_eq!(outcome.summary.provider_calls, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_previous_snapshot() {
        setup();
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("categories.csv");
        let output = dir.path().join("index.json");
        fs::write(&source, "id,name\nc-1,Laptops\n").unwrap();

        let healthy = Arc::new(ScriptedProvider::default());
        vectorizer(healthy, 10).vectorize_file(&source, &output).await.unwrap();
        let before = fs::read(&output).unwrap();

        fs::write(&source, "id,name\nc-1,Desktops\n").unwrap();
        let flaky = Arc::new(ScriptedProvider {
            transient_failures: AtomicUsize::new(10),
            ..Default::default()
        });
        let err = vectorizer(flaky.clone(), 10)
            .vectorize_file(&source, &output)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ProviderFailure { .. }));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fs::read(&output).unwrap(), before);
    }

    #[tokio::test]
    async fn test_duplicate_ids_and_dimension_mismatch_are_item_failures() {
        let provider = Arc::new(ScriptedProvider::default());
        let input = vec![
            SourceRow::new("a", "Laptops", ""),
            SourceRow::new("a", "Tablets", ""),
            SourceRow::new("b", "short vector", ""),
            SourceRow::new("c", "Monitors", ""),
        ];
        let outcome = vectorizer(provider, 10).vectorize(&input, None).await.unwrap();

        assert_eq!(outcome.summary.succeeded, 2);
        assert_eq!(outcome.summary.failed, 2);
        let failed: Vec<_> = outcome
            .summary
            .errors
            .iter()
            .filter_map(|e| e.id.as_deref())
            .collect();
        assert_eq!(failed, vec!["a", "b"]);
        assert_eq!(outcome.index.dimension(), 3);
    }

    #[tokio::test]
    async fn test_rejected_source_rows_count_as_failures() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("categories.csv");
        let output = dir.path().join("index.json");
        fs::write(&source, "id,name\nc-1,Laptops\n,Nameless\n").unwrap();

        let outcome = vectorizer(Arc::new(ScriptedProvider::default()), 10)
            .vectorize_file(&source, &output)
            .await
            .unwrap();
        assert_eq!(outcome.summary.succeeded, 1);
        assert_eq!(outcome.summary.failed, 1);
        assert!(VectorIndex::load(&output).is_built());
    }
}
