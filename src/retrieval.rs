//! # Retrieval service
//!
//! The query and rebuild paths over one served vector index.
//!
//! - [`RetrievalService::search`] embeds the query text and ranks the records of the current
//!   snapshot. Readers never wait on a rebuild: each search works off the `Arc` it loaded.
//! - [`RetrievalService::vectorize`] rebuilds an index from a source file. Rebuilds are
//!   serialized by a single-writer lock; when the output is the served file, the fresh snapshot
//!   is swapped in once it has been saved.
//! - [`RetrievalService::resolve_data_path`] confines caller-supplied paths to the directory of
//!   the served index, for surfaces that take paths from untrusted input.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    embedding::EmbeddingProvider,
    error::{Error, Result},
    vector_store::{IndexHandle, SimilaritySearch, validate_search_params},
    vectorizer::{ItemError, Vectorizer},
};

pub const DEFAULT_TOP_K: i64 = 5;

/// One ranked record, owned so it can outlive the snapshot it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub name: String,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub similarity: f64,
}

/// What a rebuild produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorizeReport {
    pub message: String,
    /// Records in the written index.
    pub total: usize,
    pub output_path: String,
    pub succeeded: usize,
    pub failed: usize,
    pub reused: usize,
    pub errors: Vec<ItemError>,
}

pub struct RetrievalService {
    index: Arc<IndexHandle>,
    embedder: Arc<dyn EmbeddingProvider>,
    vectorizer: Vectorizer,
    default_source: PathBuf,
    rebuild_lock: Mutex<()>,
}

impl RetrievalService {
    pub fn new(
        index: Arc<IndexHandle>,
        embedder: Arc<dyn EmbeddingProvider>,
        vectorizer: Vectorizer,
        default_source: impl Into<PathBuf>,
    ) -> Self {
        Self {
            index,
            embedder,
            vectorizer,
            default_source: default_source.into(),
            rebuild_lock: Mutex::new(()),
        }
    }

    pub fn index(&self) -> &IndexHandle {
        &self.index
    }

    pub fn is_built(&self) -> bool {
        self.index.current().is_built()
    }

    /// Directory holding the served index; relative request paths resolve against it.
    pub fn data_dir(&self) -> &Path {
        match self.index.path().parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Resolve `path` under [`data_dir`](Self::data_dir).
    ///
    /// # Errors
    /// [`Error::InvalidInput`] for an empty or absolute path, or one containing `..`.
    pub fn resolve_data_path(&self, path: &Path) -> Result<PathBuf> {
        let mut parts = path.components().peekable();
        if parts.peek().is_none() {
            return Err(Error::invalid_input("path must not be empty"));
        }
        if !parts.all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
            return Err(Error::invalid_input(format!(
                "path `{}` must be relative to the data directory and must not contain `..`",
                path.display()
            )));
        }
        Ok(self.data_dir().join(path))
    }

    /// Rank indexed records against `query`.
    ///
    /// # Errors
    /// - [`Error::InvalidInput`] for an empty query, `top_k > 50`, a non-finite
    ///   `min_similarity`, or an embedding whose length differs from the index.
    /// - [`Error::IndexNotBuilt`] when no index has been built yet, or the index was built with
    ///   a different embedding model than the one that would embed the query.
    /// - [`Error::ProviderFailure`] when embedding the query failed.
    pub async fn search(
        &self,
        query: &str,
        top_k: i64,
        min_similarity: f64,
    ) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::invalid_input("query must not be empty"));
        }
        validate_search_params(top_k, min_similarity)?;

        let snapshot = self.index.current();
        let index = snapshot.ready()?;
        if index.model() != self.embedder.model() {
            return Err(Error::index_not_built(format!(
                "index was built with `{}` but queries are embedded with `{}`; re-run vectorize",
                index.model(),
                self.embedder.model()
            )));
        }
        if top_k <= 0 || index.is_empty() {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed(query).await?;
        let hits = index.search(&vector, top_k, min_similarity)?;
        debug!("Query {:?} matched {} records", query, hits.len());

        Ok(hits
            .into_iter()
            .map(|hit| SearchResult {
                id: hit.record.id.clone(),
                name: hit.record.label.clone(),
                source_url: hit.record.source_url.clone(),
                created_at: hit.record.created_at,
                updated_at: hit.record.updated_at,
                similarity: hit.score,
            })
            .collect())
    }

    /// Rebuild an index from `source` into `output` (defaults: the configured source and the
    /// served index path).
    pub async fn vectorize(
        &self,
        source: Option<&Path>,
        output: Option<&Path>,
    ) -> Result<VectorizeReport> {
        let source = source.unwrap_or(self.default_source.as_path());
        let output = output.unwrap_or(self.index.path());

        let _guard = self.rebuild_lock.lock().await;
        info!("Vectorizing {} into {}", source.display(), output.display());
        let outcome = self.vectorizer.vectorize_file(source, output).await?;

        let total = outcome.index.len();
        if output == self.index.path() {
            self.index.replace(outcome.index);
        }
        let summary = outcome.summary;
        info!(
            "Vectorized {} rows ({} reused, {} failed) into {}",
            summary.succeeded,
            summary.reused,
            summary.failed,
            output.display()
        );

        Ok(VectorizeReport {
            message: format!(
                "Vectorized {} of {} rows",
                summary.succeeded,
                summary.succeeded + summary.failed
            ),
            total,
            output_path: output.display().to_string(),
            succeeded: summary.succeeded,
            failed: summary.failed,
            reused: summary.reused,
            errors: summary.errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ProviderErrorKind, vectorizer::RetryPolicy};
    use async_trait::async_trait;
    use std::{
        fs,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tempfile::TempDir;

    fn setup() {
        let _ = tracing_subscriber::fmt::try_init();
    }

    /// Maps a few keywords onto fixed axes so similarities are predictable.
    #[derive(Default)]
    struct KeywordEmbedder {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedder {
        fn model(&self) -> &str {
            "keywords"
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::provider(ProviderErrorKind::Timeout, "slow"));
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        if t.contains("laptop") { 1.0 } else { 0.0 },
                        if t.contains("phone") { 1.0 } else { 0.0 },
                        if t.contains("camera") { 1.0 } else { 0.0 },
                        0.1,
                    ]
                })
                .collect())
        }
    }

    fn service(dir: &TempDir, embedder: Arc<KeywordEmbedder>) -> RetrievalService {
        let source = dir.path().join("categories.csv");
        fs::write(
            &source,
            "id,name,source_url\n\
             c-1,Laptops,https://shop/laptops\n\
             c-2,Phones,https://shop/phones\n\
             c-3,Cameras,https://shop/cameras\n\
             c-4,Gaming Laptops,https://shop/gaming-laptops\n",
        )
        .unwrap();
        let index = Arc::new(IndexHandle::open(dir.path().join("index.json")));
        let vectorizer = Vectorizer::new(
            embedder.clone(),
            10,
            RetryPolicy {
                attempts: 1,
                base_delay: Duration::ZERO,
            },
        );
        RetrievalService::new(index, embedder, vectorizer, source)
    }

    #[tokio::test]
    async fn test_search_before_vectorize_is_index_not_built() {
        setup();
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(KeywordEmbedder::default());
        let service = service(&dir, embedder.clone());

        let err = service.search("laptop", 5, 0.0).await.unwrap_err();
        assert!(matches!(err, Error::IndexNotBuilt { .. }));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_vectorize_then_search() {
        setup();
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(KeywordEmbedder::default()));

        let report = service.vectorize(None, None).await.unwrap();
        assert_eq!(report.total, 4);
        assert_eq!(report.succeeded, 4);
        assert!(service.is_built());

        let results = service.search("laptop", 3, 0.0).await.unwrap();
        assert!(results.len() <= 3);
        assert_eq!(results[0].id, "c-1");
        assert_eq!(results[1].id, "c-4");
        assert!(results.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        assert_eq!(results[0].source_url, "https://shop/laptops");
    }

    #[tokio::test]
    async fn test_high_threshold_returns_empty() {
        setup();
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(KeywordEmbedder::default()));
        service.vectorize(None, None).await.unwrap();

        assert!(service.search("laptop", 3, 1.1).await.unwrap().is_empty());
        assert!(service.search("furniture", 3, 0.9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_search_input() {
        setup();
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(KeywordEmbedder::default()));
        service.vectorize(None, None).await.unwrap();

        assert!(matches!(
            service.search("  ", 3, 0.0).await,
            Err(Error::InvalidInput { .. })
        ));
        assert!(matches!(
            service.search("laptop", 51, 0.0).await,
            Err(Error::InvalidInput { .. })
        ));
        assert!(matches!(
            service.search("laptop", 3, f64::NAN).await,
            Err(Error::InvalidInput { .. })
        ));
        assert!(service.search("laptop", 0, 0.0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vectorize_rerun_reuses_everything() {
        setup();
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(KeywordEmbedder::default());
        let service = service(&dir, embedder.clone());

        service.vectorize(None, None).await.unwrap();
        let first = fs::read(dir.path().join("index.json")).unwrap();
        let calls = embedder.calls.load(Ordering::SeqCst);

        let report = service.vectorize(None, None).await.unwrap();
        assert_eq!(report.reused, 4);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), calls);
        assert_eq!(fs::read(dir.path().join("index.json")).unwrap(), first);
    }

    #[tokio::test]
    async fn test_vectorize_to_other_output_keeps_served_index() {
        setup();
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(KeywordEmbedder::default()));
        let other = dir.path().join("other.json");

        let report = service.vectorize(None, Some(&other)).await.unwrap();
        assert_eq!(report.output_path, other.display().to_string());
        assert!(other.exists());
        assert!(!service.is_built());
    }

    #[tokio::test]
    async fn test_failed_vectorize_keeps_previous_snapshot() {
        setup();
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(KeywordEmbedder::default()));
        service.vectorize(None, None).await.unwrap();
        let before = fs::read(dir.path().join("index.json")).unwrap();

        let changed = dir.path().join("changed.csv");
        fs::write(&changed, "id,name\nn-1,Furniture\n").unwrap();
        let failing = RetrievalService::new(
            Arc::new(IndexHandle::open(dir.path().join("index.json"))),
            Arc::new(KeywordEmbedder {
                fail: true,
                ..Default::default()
            }),
            Vectorizer::new(
                Arc::new(KeywordEmbedder {
                    fail: true,
                    ..Default::default()
                }),
                10,
                RetryPolicy {
                    attempts: 1,
                    base_delay: Duration::ZERO,
                },
            ),
            changed,
        );

        let err = failing.vectorize(None, None).await.unwrap_err();
        assert_eq!(err.error_code(), "provider_timeout");
        assert_eq!(fs::read(dir.path().join("index.json")).unwrap(), before);
        assert!(failing.is_built());
    }

    /// Same vectors as [`KeywordEmbedder`] under another model name.
    struct RenamedEmbedder(KeywordEmbedder);

    #[async_trait]
    impl EmbeddingProvider for RenamedEmbedder {
        fn model(&self) -> &str {
            "keywords-v2"
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
            self.0.embed_batch(texts).await
        }
    }

    #[tokio::test]
    async fn test_search_rejects_index_from_other_model() {
        setup();
        let dir = TempDir::new().unwrap();
        service(&dir, Arc::new(KeywordEmbedder::default()))
            .vectorize(None, None)
            .await
            .unwrap();

        let renamed: Arc<dyn EmbeddingProvider> =
            Arc::new(RenamedEmbedder(KeywordEmbedder::default()));
        let switched = RetrievalService::new(
            Arc::new(IndexHandle::open(dir.path().join("index.json"))),
            Arc::clone(&renamed),
            Vectorizer::new(
                renamed,
                10,
                RetryPolicy {
                    attempts: 1,
                    base_delay: Duration::ZERO,
                },
            ),
            dir.path().join("categories.csv"),
        );

        let err = switched.search("laptop", 3, 0.0).await.unwrap_err();
        assert!(matches!(err, Error::IndexNotBuilt { .. }));

        switched.vectorize(None, None).await.unwrap();
        assert_eq!(switched.search("laptop", 3, 0.0).await.unwrap()[0].id, "c-1");
    }

    #[tokio::test]
    async fn test_resolve_data_path_stays_inside_data_dir() {
        setup();
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(KeywordEmbedder::default()));

        assert_eq!(service.data_dir(), dir.path());
        assert_eq!(
            service.resolve_data_path(Path::new("exports/index.json")).unwrap(),
            dir.path().join("exports/index.json")
        );
        for bad in ["", "/etc/passwd", "../config.yaml", "exports/../../x.json"] {
            assert!(
                matches!(
                    service.resolve_data_path(Path::new(bad)),
                    Err(Error::InvalidInput { .. })
                ),
                "accepted {bad:?}"
            );
        }
    }
}
