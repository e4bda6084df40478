//! # Chat templates
//!
//! A template is a small YAML document that steers every chat turn:
//! - a `system_prompt` sent first in every context (unless the request brings its own),
//! - optional `pre_user_message_content` / `post_user_message_content` strings wrapped around
//!   the *outgoing* user message.
//!
//! Decoration only touches what is sent to the completion API. The message stored in the
//! session is always the text the user typed.
//!
//! Templates live under the configuration directory:
//!
//! ```text
//! <config_dir>/templates/<name>.yaml
//! ```
//!
//! ## Minimal YAML example
//!
//! ```yaml
//! system_prompt: "You are a shopping assistant. Answer using the catalogue categories."
//! # pre_user_message_content: "Customer question:"
//! # post_user_message_content: "Keep the answer under five sentences."
//! ```

use serde::{Deserialize, Serialize};
use std::{fs, io::ErrorKind, path::Path};

use crate::error::{Error, Result};

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful shopping assistant. Answer concisely and accurately.";

/// A reusable chat template.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatTemplate {
    /// Instruction sent as the first message of every context. Empty disables it.
    #[serde(default)]
    pub system_prompt: String,

    /// Extra text added **before** the outgoing user message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_user_message_content: Option<String>,

    /// Extra text added **after** the outgoing user message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_user_message_content: Option<String>,
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            pre_user_message_content: None,
            post_user_message_content: None,
        }
    }
}

impl ChatTemplate {
    /// The system prompt, or `None` when the template leaves it blank.
    pub fn system_prompt(&self) -> Option<&str> {
        let prompt = self.system_prompt.trim();
        (!prompt.is_empty()).then_some(prompt)
    }

    /// Wrap `question` with the pre/post content, separated by single spaces.
    pub fn decorate(&self, question: &str) -> String {
        let mut question = question.to_string();
        if let Some(prepend) = self
            .pre_user_message_content
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            question = format!("{prepend} {question}");
        }
        if let Some(append) = self
            .post_user_message_content
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            question = format!("{question} {append}");
        }
        question
    }
}

/// Load `<templates_dir>/<name>.yaml`.
///
/// # Errors
/// - [`Error::InvalidInput`] if `name` is not a plain file stem, the file does not exist, or
///   the YAML does not describe a [`ChatTemplate`].
/// - [`Error::PersistenceFailure`] for other read errors.
///
/// # Examples
/// ```no_run
/// use shopscope::template::load_template;
///
/// # async fn demo() -> shopscope::error::Result<()> {
/// let dir = shopscope::config_dir()?.join("templates");
/// let tpl = load_template(&dir, "shopping").await?;
/// println!("{}", tpl.system_prompt);
/// # Ok(()) }
/// ```
pub async fn load_template(templates_dir: &Path, name: &str) -> Result<ChatTemplate> {
    let plain = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if !plain {
        return Err(Error::invalid_input(format!("invalid template name `{name}`")));
    }

    let path = templates_dir.join(format!("{name}.yaml"));
    tracing::info!("Loading template: {}", path.display());

    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(Error::invalid_input(format!(
                "template not found: {}",
                path.display()
            )));
        }
        Err(e) => return Err(Error::persistence(&path, e)),
    };
    serde_yaml::from_str(&content).map_err(|e| {
        Error::invalid_input(format!("template {} is malformed: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_template_valid_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("shopping.yaml"),
            r#"
system_prompt: "You are a helpful assistant."
post_user_message_content: "Be brief."
"#,
        )
        .unwrap();

        let template = load_template(dir.path(), "shopping").await.unwrap();
        assert_eq!(template.system_prompt(), Some("You are a helpful assistant."));
        assert_eq!(template.decorate("Hi"), "Hi Be brief.");
    }

    #[tokio::test]
    async fn test_load_template_missing_file() {
        let dir = TempDir::new().unwrap();
        let template = load_template(dir.path(), "nope").await;
        assert!(matches!(template, Err(Error::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_load_template_rejects_path_like_names() {
        let dir = TempDir::new().unwrap();
        assert!(load_template(dir.path(), "../secrets").await.is_err());
        assert!(load_template(dir.path(), "").await.is_err());
    }

    #[tokio::test]
    async fn test_load_template_invalid_format() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bad.yaml"), "invalid: template: format").unwrap();
        assert!(load_template(dir.path(), "bad").await.is_err());
    }

    #[test]
    fn test_decorate_both_sides_and_blank_prompt() {
        let template = ChatTemplate {
            system_prompt: "   ".to_string(),
            pre_user_message_content: Some("Q:".to_string()),
            post_user_message_content: Some("Thanks.".to_string()),
        };
        assert_eq!(template.decorate("Which laptop?"), "Q: Which laptop? Thanks.");
        assert_eq!(template.system_prompt(), None);
        assert_eq!(ChatTemplate::default().decorate("plain"), "plain");
    }
}
