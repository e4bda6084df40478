//! Shared plumbing for the OpenAI compatible HTTP providers.
//!
//! Both [`crate::embedding::HttpEmbeddingProvider`] and
//! [`crate::completion::HttpCompletionProvider`] talk to the same kind of endpoint: a base URL,
//! a bearer key, a JSON POST. This module owns the parts they share: client construction with a
//! hard timeout, auth headers, and turning a response into either a typed `async_openai` response
//! or a typed [`Error::ProviderFailure`].
//!
//! Requests go out on our own [`reqwest::Client`] rather than `async_openai::Client`: the latter
//! retries 429 and 5xx answers internally, and chat turns must be sent exactly once.

use reqwest::{
    Client,
    header::{AUTHORIZATION, HeaderMap, HeaderValue},
};
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, ProviderErrorKind, Result};

/// Longest provider error body echoed back in an error message.
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Where and how to reach one model.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    /// Base URL without trailing path, e.g. `https://api.deepseek.com/v1`.
    pub api_base: String,
    /// Bearer token. Empty means no `Authorization` header (local servers).
    pub api_key: String,
    pub model: String,
    /// Upper bound for a whole request, connect to last body byte.
    pub timeout: Duration,
}

impl Endpoint {
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

/// Build a client whose every request is bounded by `timeout`.
pub(crate) fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::provider(ProviderErrorKind::Transport, format!("client setup: {e}")))
}

pub(crate) fn auth_headers(api_key: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if !api_key.is_empty() {
        let value = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
            Error::invalid_input("api key contains characters not allowed in a header")
        })?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

/// POST `body` to `path` under the endpoint and decode the answer as `T`.
///
/// Non-2xx statuses become [`ProviderErrorKind::Status`] with a clipped copy of the body.
/// Bodies that do not decode as `T` become [`ProviderErrorKind::InvalidResponse`].
pub(crate) async fn post_json<B, T>(
    client: &Client,
    endpoint: &Endpoint,
    path: &str,
    body: &B,
    what: &str,
) -> Result<T>
where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
{
    let url = endpoint.url(path);
    debug!("POST {} ({})", url, what);

    let response = client
        .post(&url)
        .headers(auth_headers(&endpoint.api_key)?)
        .json(body)
        .send()
        .await
        .map_err(|e| Error::from_reqwest(what, e))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| Error::from_reqwest(what, e))?;

    if !status.is_success() {
        let clipped: String = text.chars().take(MAX_ERROR_BODY_CHARS).collect();
        return Err(Error::provider(
            ProviderErrorKind::Status(status.as_u16()),
            format!("{what}: HTTP {status}: {clipped}"),
        ));
    }

    serde_json::from_str(&text).map_err(|e| {
        Error::provider(
            ProviderErrorKind::InvalidResponse,
            format!("{what}: unexpected response body: {e}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slashes() {
        let endpoint = Endpoint {
            api_base: "http://localhost:5001/v1/".to_string(),
            api_key: String::new(),
            model: "m".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(endpoint.url("/embeddings"), "http://localhost:5001/v1/embeddings");
        assert_eq!(
            endpoint.url("chat/completions"),
            "http://localhost:5001/v1/chat/completions"
        );
    }

    #[test]
    fn test_auth_headers() {
        let headers = auth_headers("sk-test").unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sk-test");
        assert!(auth_headers("").unwrap().is_empty());
        assert!(auth_headers("bad\nkey").is_err());
    }
}
