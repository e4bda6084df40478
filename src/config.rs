//! Loading and validating the application's configuration.
//!
//! The configuration is one YAML file deserialized into [`ShopscopeConfig`]. Every field has a
//! default, so a partial file (or an empty one) is valid:
//!
//! ```yaml
//! api_key: "sk-..."
//! api_base: "https://api.deepseek.com/v1"
//! chat_model: "deepseek-chat"
//! embedding_model: "deepseek-embedding"
//! request_timeout_secs: 30
//! history_limit: 10
//! storage:
//!   chat_history_dir: "data/chat_history"
//!   vector_index_path: "data/vectorized_categories.json"
//!   source_path: "categories.csv"
//! vectorizer:
//!   batch_size: 10
//!   retry_attempts: 3
//!   retry_base_delay_ms: 500
//! http_bind: "127.0.0.1:8000"
//! ```
//!
//! `SHOPSCOPE_API_KEY`, when set, replaces `api_key`, so the key does not have to live in the
//! file.
//!
//! # Examples
//!
//! ```no_run
//! use shopscope::config::load_config;
//!
//! let config = load_config("/path/to/config.yaml".as_ref()).unwrap();
//! println!("{:?}", config.chat_endpoint());
//! ```

use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

use crate::{
    completion::CompletionOptions,
    context::{ContextAssembler, DEFAULT_HISTORY_LIMIT},
    error::{Error, Result},
    provider::Endpoint,
    vectorizer::RetryPolicy,
};

pub const API_KEY_ENV: &str = "SHOPSCOPE_API_KEY";

/// File locations, relative paths being relative to the working directory.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub chat_history_dir: PathBuf,
    pub vector_index_path: PathBuf,
    pub source_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chat_history_dir: PathBuf::from("data/chat_history"),
            vector_index_path: PathBuf::from("data/vectorized_categories.json"),
            source_path: PathBuf::from("categories.csv"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct VectorizerConfig {
    /// Texts per embedding call.
    pub batch_size: usize,
    /// Attempts per batch, the first one included.
    pub retry_attempts: u32,
    /// Delay before the first retry; doubles for each later one.
    pub retry_base_delay_ms: u64,
}

impl Default for VectorizerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
        }
    }
}

/// Represents the application's configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct ShopscopeConfig {
    /// Bearer key for the provider API. Empty sends no `Authorization` header.
    pub api_key: String,

    /// Base URL of the OpenAI compatible API.
    pub api_base: String,

    pub chat_model: String,

    pub embedding_model: String,

    /// Upper bound for every provider call, in seconds.
    pub request_timeout_secs: u64,

    /// Stored messages sent with each turn.
    pub history_limit: usize,

    /// Optional token budget for the whole context; trims the oldest history first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<usize>,

    pub default_temperature: f64,

    pub default_max_tokens: u32,

    /// Largest `maxTokens` a request may ask for.
    pub max_tokens_limit: u32,

    /// Template name under `<config_dir>/templates/`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    pub storage: StorageConfig,

    pub vectorizer: VectorizerConfig,

    /// Address the HTTP server listens on.
    pub http_bind: String,

    /// Log filter used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for ShopscopeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: "https://api.deepseek.com/v1".to_string(),
            chat_model: "deepseek-chat".to_string(),
            embedding_model: "deepseek-embedding".to_string(),
            request_timeout_secs: 30,
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_context_tokens: None,
            default_temperature: 0.7,
            default_max_tokens: 2000,
            max_tokens_limit: 8192,
            template: None,
            storage: StorageConfig::default(),
            vectorizer: VectorizerConfig::default(),
            http_bind: "127.0.0.1:8000".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl ShopscopeConfig {
    /// Reject settings that would make the service misbehave rather than fail.
    ///
    /// # Errors
    /// [`Error::InvalidInput`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            return Err(Error::invalid_input("request_timeout_secs must be positive"));
        }
        if self.history_limit == 0 {
            return Err(Error::invalid_input("history_limit must be positive"));
        }
        if self.vectorizer.batch_size == 0 {
            return Err(Error::invalid_input("vectorizer.batch_size must be positive"));
        }
        if self.default_max_tokens > self.max_tokens_limit {
            return Err(Error::invalid_input(format!(
                "default_max_tokens ({}) exceeds max_tokens_limit ({})",
                self.default_max_tokens, self.max_tokens_limit
            )));
        }
        self.completion_defaults()
            .validate(self.max_tokens_limit)
            .map_err(|e| Error::invalid_input(format!("default completion options: {e}")))?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn chat_endpoint(&self) -> Endpoint {
        self.endpoint(&self.chat_model)
    }

    pub fn embedding_endpoint(&self) -> Endpoint {
        self.endpoint(&self.embedding_model)
    }

    pub fn completion_defaults(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: self.default_temperature,
            max_tokens: self.default_max_tokens,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.vectorizer.retry_attempts,
            base_delay: Duration::from_millis(self.vectorizer.retry_base_delay_ms),
        }
    }

    pub fn context_assembler(&self) -> ContextAssembler {
        ContextAssembler::new(self.history_limit).with_token_budget(self.max_context_tokens)
    }

    fn endpoint(&self, model: &str) -> Endpoint {
        Endpoint {
            api_base: self.api_base.clone(),
            api_key: self.api_key.clone(),
            model: model.to_string(),
            timeout: self.request_timeout(),
        }
    }

    fn apply_env(&mut self) {
        if let Ok(key) = env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                debug!("Using API key from {}", API_KEY_ENV);
                self.api_key = key.trim().to_string();
            }
        }
    }
}

/// Loads the configuration from a YAML file, applies the environment override and validates it.
///
/// # Errors
/// - [`Error::InvalidInput`] if the file does not exist, is not valid YAML for
///   [`ShopscopeConfig`], or fails [`ShopscopeConfig::validate`].
/// - [`Error::PersistenceFailure`] for other read errors.
pub fn load_config(file: &Path) -> Result<ShopscopeConfig> {
    debug!("Loading config from {}", file.display());
    let content = match fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(Error::invalid_input(format!(
                "config file not found: {} (run `shopscope init`)",
                file.display()
            )));
        }
        Err(e) => return Err(Error::persistence(file, e)),
    };
    let mut config: ShopscopeConfig = if content.trim().is_empty() {
        ShopscopeConfig::default()
    } else {
        serde_yaml::from_str(&content).map_err(|e| {
            Error::invalid_input(format!("config {} is malformed: {e}", file.display()))
        })?
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
}
