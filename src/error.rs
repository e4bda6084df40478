//! # Error taxonomy
//!
//! Every fallible operation in the crate returns [`Result<T>`], whose error side is the
//! single [`Error`] enum below. Callers branch on the variant (or on the stable
//! [`Error::error_code`] string when the error has crossed a process boundary).
//!
//! | Variant | Raised when |
//! |---|---|
//! | [`Error::NotFound`] | a session (or other addressed record) does not exist |
//! | [`Error::InvalidInput`] | a request is malformed: bad `topK`, empty message, unknown role, ... |
//! | [`Error::ProviderFailure`] | an embedding or completion call failed, including timeouts |
//! | [`Error::PersistenceFailure`] | a file could not be read or written |
//! | [`Error::IndexNotBuilt`] | a search ran before any vectorization produced an index |
//!
//! `InvalidInput` and `NotFound` are never retried. Provider failures report whether a retry
//! could help through [`Error::is_retryable`]; only the vectorizer acts on that.

use std::{fmt, path::Path};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong on the wire when a provider call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The call did not finish within the configured timeout.
    Timeout,
    /// Connection, TLS or body transfer error.
    Transport,
    /// The provider answered with a non-success HTTP status.
    Status(u16),
    /// The provider answered 2xx but the body did not have the expected shape.
    InvalidResponse,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::Timeout => f.write_str("timeout"),
            ProviderErrorKind::Transport => f.write_str("transport"),
            ProviderErrorKind::Status(code) => write!(f, "status {code}"),
            ProviderErrorKind::InvalidResponse => f.write_str("invalid response"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("provider failure ({kind}): {message}")]
    ProviderFailure {
        kind: ProviderErrorKind,
        message: String,
    },

    /// A read or write against the data directory failed.
    ///
    /// When the completion already succeeded, `unsaved_reply` holds the reply text so the
    /// caller can still show it while knowing the turn was not saved.
    #[error("persistence failure: {message}")]
    PersistenceFailure {
        message: String,
        unsaved_reply: Option<String>,
    },

    #[error("vector index not built: {reason}")]
    IndexNotBuilt { reason: String },
}

impl Error {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput {
            message: message.into(),
        }
    }

    pub fn provider(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Error::ProviderFailure {
            kind,
            message: message.into(),
        }
    }

    /// Wrap an I/O or encoding error raised while touching `path`.
    pub fn persistence(path: &Path, err: impl fmt::Display) -> Self {
        Error::PersistenceFailure {
            message: format!("{}: {err}", path.display()),
            unsaved_reply: None,
        }
    }

    pub fn index_not_built(reason: impl Into<String>) -> Self {
        Error::IndexNotBuilt {
            reason: reason.into(),
        }
    }

    /// Classify a `reqwest` failure. Timeouts are kept apart from other transport errors.
    pub fn from_reqwest(what: &str, err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else if let Some(status) = err.status() {
            ProviderErrorKind::Status(status.as_u16())
        } else if err.is_decode() {
            ProviderErrorKind::InvalidResponse
        } else {
            ProviderErrorKind::Transport
        };
        Error::provider(kind, format!("{what}: {err}"))
    }

    /// Attach the reply text of a turn that completed but could not be saved.
    pub fn with_unsaved_reply(self, reply: String) -> Self {
        match self {
            Error::PersistenceFailure { message, .. } => Error::PersistenceFailure {
                message,
                unsaved_reply: Some(reply),
            },
            other => other,
        }
    }

    /// Stable machine-readable code, used in HTTP error bodies and CLI output.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::InvalidInput { .. } => "invalid_input",
            Error::ProviderFailure {
                kind: ProviderErrorKind::Timeout,
                ..
            } => "provider_timeout",
            Error::ProviderFailure { .. } => "provider_failure",
            Error::PersistenceFailure { .. } => "persistence_failure",
            Error::IndexNotBuilt { .. } => "index_not_built",
        }
    }

    /// True for provider errors a later attempt might not hit: timeouts, transport errors,
    /// HTTP 429 and 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ProviderFailure { kind, .. } => match kind {
                ProviderErrorKind::Timeout | ProviderErrorKind::Transport => true,
                ProviderErrorKind::Status(code) => *code == 429 || *code >= 500,
                ProviderErrorKind::InvalidResponse => false,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::not_found("session", "abc").error_code(), "not_found");
        assert_eq!(Error::invalid_input("bad").error_code(), "invalid_input");
        assert_eq!(
            Error::provider(ProviderErrorKind::Timeout, "slow").error_code(),
            "provider_timeout"
        );
        assert_eq!(
            Error::provider(ProviderErrorKind::Status(500), "boom").error_code(),
            "provider_failure"
        );
        assert_eq!(
            Error::persistence(&PathBuf::from("x.json"), "disk full").error_code(),
            "persistence_failure"
        );
        assert_eq!(Error::index_not_built("missing").error_code(), "index_not_built");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::provider(ProviderErrorKind::Timeout, "").is_retryable());
        assert!(Error::provider(ProviderErrorKind::Transport, "").is_retryable());
        assert!(Error::provider(ProviderErrorKind::Status(503), "").is_retryable());
        assert!(Error::provider(ProviderErrorKind::Status(429), "").is_retryable());
        assert!(!Error::provider(ProviderErrorKind::Status(400), "").is_retryable());
        assert!(!Error::provider(ProviderErrorKind::InvalidResponse, "").is_retryable());
        assert!(!Error::invalid_input("nope").is_retryable());
    }

    #[test]
    fn test_unsaved_reply_only_attaches_to_persistence_failures() {
        let err = Error::persistence(&PathBuf::from("s.json"), "read-only")
            .with_unsaved_reply("Hi".to_string());
        match err {
            Error::PersistenceFailure { unsaved_reply, .. } => {
                assert_eq!(unsaved_reply.as_deref(), Some("Hi"))
            }
            other => panic!("unexpected variant: {other:?}"),
        }

        let err = Error::not_found("session", "x").with_unsaved_reply("Hi".to_string());
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::not_found("session", "abc");
        assert_eq!(err.to_string(), "session not found: abc");

        let err = Error::provider(ProviderErrorKind::Status(502), "bad gateway");
        assert_eq!(err.to_string(), "provider failure (status 502): bad gateway");
    }
}
