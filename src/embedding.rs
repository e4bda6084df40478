//! # Embedding providers
//!
//! [`EmbeddingProvider`] turns text into fixed-length vectors. The crate ships one
//! implementation, [`HttpEmbeddingProvider`], which speaks the OpenAI compatible
//! `POST {api_base}/embeddings` protocol:
//!
//! ```text
//! request:  {"model": "...", "input": ["text one", "text two"]}
//! response: {"object": "list", "model": "...", "data": [{"index": 0, "embedding": [..]}, ..], "usage": {..}}
//! ```
//!
//! Both sides are the `async_openai` embedding types. Results are reordered by `index`, so callers always get vectors in input order. Every call is
//! bounded by the endpoint timeout; a timeout surfaces as
//! [`ProviderErrorKind::Timeout`](crate::error::ProviderErrorKind::Timeout). Providers never retry
//! on their own; retry policy lives in [`crate::vectorizer`].

use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, CreateEmbeddingResponse};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::{
    error::{Error, ProviderErrorKind, Result},
    provider::{self, Endpoint},
};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model name; part of the vectorizer cache key.
    fn model(&self) -> &str;

    /// Embed every text in one call, returning vectors in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f64>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        match vectors.pop() {
            Some(vector) if vectors.is_empty() => Ok(vector),
            _ => Err(Error::provider(
                ProviderErrorKind::InvalidResponse,
                "expected exactly one embedding",
            )),
        }
    }
}

/// OpenAI compatible embeddings over HTTP.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingProvider {
    endpoint: Endpoint,
    client: Client,
}

impl HttpEmbeddingProvider {
    pub fn new(endpoint: Endpoint) -> Result<Self> {
        let client = provider::http_client(endpoint.timeout)?;
        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model(&self) -> &str {
        &self.endpoint.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = CreateEmbeddingRequestArgs::default()
            .model(self.endpoint.model.as_str())
            .input(texts.to_vec())
            .build()
            .map_err(|e| Error::invalid_input(format!("embedding request: {e}")))?;
        let response: CreateEmbeddingResponse =
            provider::post_json(&self.client, &self.endpoint, "embeddings", &body, "embeddings")
                .await?;
        let vectors = parse_embedding_response(response, texts.len())?;
        debug!("Embedded {} texts with {}", texts.len(), self.endpoint.model);
        Ok(vectors)
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::provider(ProviderErrorKind::InvalidResponse, message)
}

fn parse_embedding_response(
    response: CreateEmbeddingResponse,
    expected: usize,
) -> Result<Vec<Vec<f64>>> {
    let mut indexed: Vec<(usize, Vec<f64>)> = Vec::with_capacity(response.data.len());
    for item in response.data {
        let index = item.index as usize;
        if item.embedding.is_empty() {
            return Err(invalid(format!("embedding {index} is empty")));
        }
        let vector: Vec<f64> = item.embedding.into_iter().map(f64::from).collect();
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(invalid(format!("embedding {index} has non-finite values")));
        }
        indexed.push((index, vector));
    }

    if indexed.len() != expected {
        return Err(invalid(format!(
            "expected {expected} embeddings, got {}",
            indexed.len()
        )));
    }
    indexed.sort_by_key(|(index, _)| *index);
    if indexed.iter().enumerate().any(|(i, (index, _))| i != *index) {
        return Err(invalid("embedding indexes are not a permutation of the input"));
    }

    Ok(indexed.into_iter().map(|(_, vector)| vector).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    fn setup() {
        let _ = tracing_subscriber::fmt::try_init();
    }

    fn endpoint(base: String, timeout: Duration) -> Endpoint {
        Endpoint {
            api_base: base,
            api_key: "sk-test".to_string(),
            model: "test-embedding".to_string(),
            timeout,
        }
    }

    fn embedding_body(data: serde_json::Value) -> serde_json::Value {
        json!({
            "object": "list",
            "model": "test-embedding",
            "data": data,
            "usage": { "prompt_tokens": 4, "total_tokens": 4 }
        })
    }

    fn item(index: u32, embedding: serde_json::Value) -> serde_json::Value {
        json!({ "object": "embedding", "index": index, "embedding": embedding })
    }

    fn decode(body: serde_json::Value) -> CreateEmbeddingResponse {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_parses_embeddings_in_index_order() {
        let body = embedding_body(json!([item(1, json!([2.0, 3.0])), item(0, json!([0.5, 1.5]))]));
        let parsed = parse_embedding_response(decode(body), 2).unwrap();
        assert_eq!(parsed, vec![vec![0.5, 1.5], vec![2.0, 3.0]]);
    }

    #[test]
    fn test_rejects_count_mismatch_and_bad_indexes() {
        let body = embedding_body(json!([item(0, json!([1.0]))]));
        assert!(parse_embedding_response(decode(body), 2).is_err());

        let body = embedding_body(json!([item(3, json!([1.0]))]));
        assert!(parse_embedding_response(decode(body), 1).is_err());

        let body = embedding_body(json!([item(0, json!([]))]));
        assert!(parse_embedding_response(decode(body), 1).is_err());
    }

    #[tokio::test]
    async fn test_http_provider_posts_batch() {
        setup();
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/embeddings")
                    .header("authorization", "Bearer sk-test")
                    .body_includes(r#""model":"test-embedding""#)
                    .body_includes(r#""input":["laptops","phones"]"#);
                then.status(200).json_body(embedding_body(json!([
                    item(0, json!([0.25, 0.5])),
                    item(1, json!([0.75, 1.0]))
                ])));
            })
            .await;

        let provider =
            HttpEmbeddingProvider::new(endpoint(server.url("/v1"), Duration::from_secs(5))).unwrap();
        let vectors = provider
            .embed_batch(&["laptops".to_string(), "phones".to_string()])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(vectors, vec![vec![0.25, 0.5], vec![0.75, 1.0]]);
    }

    #[tokio::test]
    async fn test_http_provider_maps_server_errors() {
        setup();
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(503).body("overloaded");
            })
            .await;

        let provider =
            HttpEmbeddingProvider::new(endpoint(server.url("/v1"), Duration::from_secs(5))).unwrap();
        let err = provider.embed("laptops").await.unwrap_err();
        assert!(matches!(
            err,
            Error::ProviderFailure {
                kind: ProviderErrorKind::Status(503),
                ..
            }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_http_provider_times_out() {
        setup();
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(200)
                    .delay(Duration::from_millis(500))
                    .json_body(embedding_body(json!([item(0, json!([1.0]))])));
            })
            .await;

        let provider =
            HttpEmbeddingProvider::new(endpoint(server.url("/v1"), Duration::from_millis(50)))
                .unwrap();
        let err = provider.embed("laptops").await.unwrap_err();
        assert_eq!(err.error_code(), "provider_timeout");
    }

    #[tokio::test]
    async fn test_http_provider_rejects_non_json() {
        setup();
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(200).body("<html>oops</html>");
            })
            .await;

        let provider =
            HttpEmbeddingProvider::new(endpoint(server.url("/v1"), Duration::from_secs(5))).unwrap();
        let err = provider.embed("laptops").await.unwrap_err();
        assert!(matches!(
            err,
            Error::ProviderFailure {
                kind: ProviderErrorKind::InvalidResponse,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_batch_makes_no_call() {
        let provider = HttpEmbeddingProvider::new(endpoint(
            "http://127.0.0.1:9".to_string(),
            Duration::from_millis(50),
        ))
        .unwrap();
        assert!(provider.embed_batch(&[]).await.unwrap().is_empty());
    }
}
