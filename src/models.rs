//! # Data models
//!
//! Plain serde structs shared by the stores, the providers and the HTTP layer.
//!
//! - [`ChatMessage`] / [`NewMessage`]: one turn in a session, as stored and as submitted.
//! - [`ChatSession`] / [`SessionSummary`]: a session with its messages, and the light
//!   metadata row kept in the session index.
//! - [`EmbeddingRecord`]: one vectorized source row.
//! - [`PromptMessage`] / [`Usage`]: what goes to and comes back from the completion API.
//!
//! All JSON uses camelCase keys. Every struct rejects unknown roles at deserialization time,
//! so malformed input is refused at the boundary instead of being coerced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{Error, Result};

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message as stored in a session. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// A message submitted for appending. `id` and `timestamp` are assigned by the store
/// when absent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewMessage {
    pub id: Option<String>,
    pub role: Option<Role>,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role: Some(role),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Fill in the missing identity fields and check the shape.
    pub(crate) fn finalize(self, now: DateTime<Utc>) -> Result<ChatMessage> {
        let role = self
            .role
            .ok_or_else(|| Error::invalid_input("message role is required"))?;
        if self.content.trim().is_empty() {
            return Err(Error::invalid_input("message content must not be empty"));
        }
        let id = match self.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };
        Ok(ChatMessage {
            id,
            role,
            content: self.content,
            timestamp: self.timestamp.unwrap_or(now),
            metadata: self.metadata,
        })
    }
}

/// A conversation thread and its full history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Derive the index row for this session.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            message_count: self.messages.len(),
        }
    }
}

/// Session metadata without message bodies, as kept in the session index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

/// One vectorized source row.
///
/// All records of one index share the same vector length. `content_hash` is the cache key
/// the vectorizer uses to skip unchanged rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingRecord {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub source_url: String,
    pub vector: Vec<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub content_hash: String,
}

/// Role and content only: the shape sent to the completion API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

impl From<&ChatMessage> for PromptMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Token accounting reported by the completion API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}
