//! # Context assembly
//!
//! [`ContextAssembler`] decides what a completion call sees for one turn:
//!
//! ```text
//! [system prompt]            at most one, always first
//! [history window]           the last `history_limit` stored messages, oldest first
//! [carried request messages] earlier messages the caller sent along with this turn
//! [new message]              always last
//! ```
//!
//! The window is the cost control for the completion call: it never grows past
//! `history_limit`, however long the session gets. When a token budget is configured the
//! window is trimmed further, oldest message first, until the estimate fits. The system
//! prompt, carried messages and the new message are never trimmed.
//!
//! Assembly is pure: the session is only read, never modified.

use once_cell::sync::Lazy;
use tiktoken_rs::{CoreBPE, cl100k_base};
use tracing::debug;

use crate::models::{ChatSession, PromptMessage};

pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Per-message framing tokens added by chat formats on top of the content.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

static BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| cl100k_base().ok());

/// Token estimate for one message: cl100k when available, else four characters per token.
pub fn count_tokens(message: &PromptMessage) -> usize {
    let content = match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(&message.content).len(),
        None => message.content.chars().count().div_ceil(4),
    };
    content + MESSAGE_OVERHEAD_TOKENS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextAssembler {
    history_limit: usize,
    max_context_tokens: Option<usize>,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl ContextAssembler {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit,
            max_context_tokens: None,
        }
    }

    /// Trim the history window further until the whole context fits `max_tokens`.
    pub fn with_token_budget(mut self, max_tokens: Option<usize>) -> Self {
        self.max_context_tokens = max_tokens;
        self
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// System prompt, bounded history, new message.
    pub fn build_context(
        &self,
        session: Option<&ChatSession>,
        new_message: PromptMessage,
        system_prompt: Option<&str>,
    ) -> Vec<PromptMessage> {
        self.assemble(session, &[], new_message, system_prompt)
    }

    /// Like [`build_context`](Self::build_context), with extra request messages placed between
    /// the history window and the new message.
    ///
    /// When the first carried message repeats the last history message (same role and
    /// content) it is skipped, so a client that echoes its last turn back does not double it.
    pub fn assemble(
        &self,
        session: Option<&ChatSession>,
        carried: &[PromptMessage],
        new_message: PromptMessage,
        system_prompt: Option<&str>,
    ) -> Vec<PromptMessage> {
        let stored = session.map(|s| s.messages.as_slice()).unwrap_or_default();
        let start = stored.len().saturating_sub(self.history_limit);
        let mut history: Vec<PromptMessage> = stored[start..].iter().map(PromptMessage::from).collect();

        let carried = match (carried.first(), history.last()) {
            (Some(first), Some(last)) if first == last => &carried[1..],
            _ => carried,
        };

        let system = system_prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PromptMessage::system);

        if let Some(budget) = self.max_context_tokens {
            let fixed: usize = system
                .iter()
                .chain(carried)
                .chain(std::iter::once(&new_message))
                .map(count_tokens)
                .sum();
            let mut history_tokens: usize = history.iter().map(count_tokens).sum();
            let mut dropped = 0;
            while fixed + history_tokens > budget && dropped < history.len() {
                history_tokens -= count_tokens(&history[dropped]);
                dropped += 1;
            }
            if dropped > 0 {
                debug!(
                    "Dropped {} history messages to fit {} context tokens",
                    dropped, budget
                );
                history.drain(..dropped);
            }
        }

        let mut context = Vec::with_capacity(history.len() + carried.len() + 2);
        context.extend(system);
        context.extend(history);
        context.extend(carried.iter().cloned());
        context.push(new_message);
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewMessage, Role};
    use chrono::Utc;

    fn session_with(count: usize) -> ChatSession {
        let now = Utc::now();
        let messages = (0..count)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                NewMessage::new(role, format!("message {i}"))
                    .finalize(now)
                    .unwrap()
            })
            .collect();
        ChatSession {
            id: "s-1".to_string(),
            title: "t".to_string(),
            created_at: now,
            updated_at: now,
            messages,
        }
    }

    #[test]
    fn test_window_is_last_n_in_order() {
        let session = session_with(25);
        let context = ContextAssembler::default().build_context(
            Some(&session),
            PromptMessage::user("new"),
            Some("be nice"),
        );

        assert_eq!(context.len(), 12);
        assert_eq!(context[0], PromptMessage::system("be nice"));
        assert_eq!(context[1].content, "message 15");
        assert_eq!(context[10].content, "message 24");
        assert_eq!(context[11], PromptMessage::user("new"));
    }

    #[test]
    fn test_short_history_and_no_session() {
        let session = session_with(3);
        let assembler = ContextAssembler::new(10);
        let context = assembler.build_context(Some(&session), PromptMessage::user("q"), None);
        assert_eq!(context.len(), 4);
        assert_eq!(context[0].content, "message 0");

        let context = assembler.build_context(None, PromptMessage::user("q"), Some("  "));
        assert_eq!(context, vec![PromptMessage::user("q")]);
    }

    #[test]
    fn test_zero_limit_sends_no_history() {
        let session = session_with(4);
        let context =
            ContextAssembler::new(0).build_context(Some(&session), PromptMessage::user("q"), None);
        assert_eq!(context, vec![PromptMessage::user("q")]);
    }

    #[test]
    fn test_session_is_not_modified() {
        let session = session_with(12);
        let before = session.clone();
        let _ = ContextAssembler::default().build_context(
            Some(&session),
            PromptMessage::user("q"),
            Some("sys"),
        );
        assert_eq!(session, before);
    }

    #[test]
    fn test_carried_messages_skip_echo_of_last_history() {
        let session = session_with(2);
        let carried = vec![
            PromptMessage::new(Role::Assistant, "message 1"),
            PromptMessage::new(Role::Assistant, "extra context"),
        ];
        let context = ContextAssembler::default().assemble(
            Some(&session),
            &carried,
            PromptMessage::user("q"),
            None,
        );
        let contents: Vec<&str> = context.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["message 0", "message 1", "extra context", "q"]);
    }

    #[test]
    fn test_token_budget_trims_oldest_history_only() {
        let session = session_with(10);
        let new_message = PromptMessage::user("the question");
        let system = PromptMessage::system("sys");
        let per_history = count_tokens(&PromptMessage::user("message 9"));
        let budget = count_tokens(&system) + count_tokens(&new_message) + per_history * 3;

        let context = ContextAssembler::new(10)
            .with_token_budget(Some(budget))
            .build_context(Some(&session), new_message.clone(), Some("sys"));

        assert_eq!(context.first(), Some(&system));
        assert_eq!(context.last(), Some(&new_message));
        assert_eq!(context.len(), 5);
        assert_eq!(context[1].content, "message 7");

        let starved = ContextAssembler::new(10)
            .with_token_budget(Some(1))
            .build_context(Some(&session), new_message.clone(), Some("sys"));
        assert_eq!(starved, vec![system, new_message]);
    }
}
