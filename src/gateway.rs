//! # Chat gateway
//!
//! [`ChatGateway`] runs one chat turn end to end. Every turn walks the same states:
//!
//! ```text
//! Pending ──► ContextBuilt ──► CompletionRequested ──► Completed
//!    │              │                   │
//!    └──────────────┴───────────────────┴────────────► Failed
//! ```
//!
//! - **Pending**: validate messages and options, load the session when an id was given.
//! - **ContextBuilt**: the [`ContextAssembler`] produced the prompt. Nothing is written yet.
//! - **CompletionRequested**: one call to the [`CompletionProvider`]. No retries.
//! - **Completed**: with `save_history`, the user message and the reply are appended as one
//!   pair under the session lock, so concurrent turns on one session never interleave.
//! - **Failed**: nothing was appended. The session is exactly as it was before the call.
//!
//! A turn whose completion succeeded but whose append failed ends in
//! [`Error::PersistenceFailure`] carrying the reply text, so callers can show it while knowing
//! the turn was not saved.

use serde::Serialize;
use serde_json::{Map, Value, json};
use std::{fmt, sync::Arc};
use tracing::{debug, info, warn};

use crate::{
    completion::{Completion, CompletionOptions, CompletionProvider, CompletionRequest},
    context::ContextAssembler,
    error::{Error, Result},
    models::{NewMessage, PromptMessage, Role, Usage},
    session_store::{SessionStore, validate_session_id},
    template::ChatTemplate,
};

/// Where a turn is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Pending,
    ContextBuilt,
    CompletionRequested,
    Completed,
    Failed,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnState::Pending => "pending",
            TurnState::ContextBuilt => "context_built",
            TurnState::CompletionRequested => "completion_requested",
            TurnState::Completed => "completed",
            TurnState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-request overrides. Unset fields fall back to the gateway defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChatOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// The outcome of a completed turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub reply: String,
    pub model: String,
    pub usage: Usage,
    /// Session the turn belongs to. Absent for stateless turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Id of the stored assistant message. Absent when history was not saved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

pub struct ChatGateway {
    store: Arc<SessionStore>,
    completion: Arc<dyn CompletionProvider>,
    assembler: ContextAssembler,
    template: ChatTemplate,
    defaults: CompletionOptions,
    max_tokens_limit: u32,
}

struct Turn {
    state: TurnState,
    label: String,
}

impl Turn {
    fn new(session_id: Option<&str>) -> Self {
        Self {
            state: TurnState::Pending,
            label: session_id.unwrap_or("<new>").to_string(),
        }
    }

    fn advance(&mut self, next: TurnState) {
        debug!("Turn {}: {} -> {}", self.label, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: Error) -> Error {
        warn!("Turn {} failed in state {}: {}", self.label, self.state, err);
        self.state = TurnState::Failed;
        err
    }
}

impl ChatGateway {
    pub fn new(
        store: Arc<SessionStore>,
        completion: Arc<dyn CompletionProvider>,
        assembler: ContextAssembler,
        template: ChatTemplate,
    ) -> Self {
        Self {
            store,
            completion,
            assembler,
            template,
            defaults: CompletionOptions::default(),
            max_tokens_limit: 8192,
        }
    }

    /// Defaults for unset request options, and the upper bound for `max_tokens`.
    pub fn with_option_defaults(mut self, defaults: CompletionOptions, max_tokens_limit: u32) -> Self {
        self.defaults = defaults;
        self.max_tokens_limit = max_tokens_limit;
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Run one turn.
    ///
    /// # Parameters
    /// - `session_id`: continue this session. `None` starts a new one (created only once the
    ///   completion succeeded) or, with `save_history == false`, runs statelessly.
    /// - `messages`: the request messages. The last must be a `user` message; at most one
    ///   `system` message may appear and it replaces the template's system prompt.
    /// - `save_history`: when false, history is read but nothing is written.
    ///
    /// # Errors
    /// - [`Error::InvalidInput`] for malformed messages, options or session ids.
    /// - [`Error::NotFound`] when `session_id` names no session.
    /// - [`Error::ProviderFailure`] when the completion call failed or timed out.
    /// - [`Error::PersistenceFailure`] (with the reply attached) when the turn completed but
    ///   could not be saved.
    pub async fn send(
        &self,
        session_id: Option<&str>,
        messages: Vec<PromptMessage>,
        options: ChatOptions,
        save_history: bool,
    ) -> Result<ChatReply> {
        let mut turn = Turn::new(session_id);

        let (system_prompt, carried, question) = match split_request(messages) {
            Ok(parts) => parts,
            Err(e) => return Err(turn.fail(e)),
        };
        let options = CompletionOptions {
            temperature: options.temperature.unwrap_or(self.defaults.temperature),
            max_tokens: options.max_tokens.unwrap_or(self.defaults.max_tokens),
        };
        if let Err(e) = options.validate(self.max_tokens_limit) {
            return Err(turn.fail(e));
        }

        let session = match session_id {
            Some(id) => match self.load_session(id).await {
                Ok(session) => Some(session),
                Err(e) => return Err(turn.fail(e)),
            },
            None => None,
        };

        let system_prompt = system_prompt.or_else(|| self.template.system_prompt().map(str::to_string));
        let outgoing = PromptMessage::user(self.template.decorate(&question));
        let context = self.assembler.assemble(
            session.as_ref(),
            &carried,
            outgoing,
            system_prompt.as_deref(),
        );
        turn.advance(TurnState::ContextBuilt);
        debug!("Context for turn {} has {} messages", turn.label, context.len());

        turn.advance(TurnState::CompletionRequested);
        let request = CompletionRequest {
            messages: context,
            options,
        };
        let completion = match self.completion.complete(&request).await {
            Ok(completion) => completion,
            Err(e) => return Err(turn.fail(e)),
        };

        if !save_history {
            turn.advance(TurnState::Completed);
            return Ok(ChatReply {
                reply: completion.content,
                model: completion.model,
                usage: completion.usage,
                session_id: session.map(|s| s.id),
                message_id: None,
            });
        }

        let session_id = match session {
            Some(session) => session.id,
            None => match self.store.create_session(None).await {
                Ok(created) => created.id,
                Err(e) => return Err(turn.fail(e.with_unsaved_reply(completion.content))),
            },
        };
        turn.label = session_id.clone();

        let pair = vec![
            NewMessage::new(Role::User, question),
            NewMessage::new(Role::Assistant, completion.content.clone())
                .with_metadata(reply_metadata(&completion)),
        ];
        let stored = match self.store.append_messages(&session_id, pair).await {
            Ok(stored) => stored,
            Err(e) => return Err(turn.fail(e.with_unsaved_reply(completion.content))),
        };

        turn.advance(TurnState::Completed);
        info!("Saved turn in session {}", session_id);
        Ok(ChatReply {
            reply: completion.content,
            model: completion.model,
            usage: completion.usage,
            session_id: Some(session_id),
            message_id: stored.last().map(|m| m.id.clone()),
        })
    }

    /// Single-message variant of [`send`](Self::send) using the default options.
    pub async fn send_simple(
        &self,
        message: &str,
        system_prompt: Option<&str>,
        session_id: Option<&str>,
        save_history: bool,
    ) -> Result<ChatReply> {
        let mut messages = Vec::with_capacity(2);
        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            messages.push(PromptMessage::system(prompt));
        }
        messages.push(PromptMessage::user(message));
        self.send(session_id, messages, ChatOptions::default(), save_history)
            .await
    }

    async fn load_session(&self, id: &str) -> Result<crate::models::ChatSession> {
        validate_session_id(id)?;
        self.store.get_session(id).await
    }
}

/// Split request messages into (system prompt, carried messages, question).
fn split_request(messages: Vec<PromptMessage>) -> Result<(Option<String>, Vec<PromptMessage>, String)> {
    let mut messages = messages;
    let last = messages
        .pop()
        .ok_or_else(|| Error::invalid_input("at least one message is required"))?;
    if last.role != Role::User {
        return Err(Error::invalid_input("the last message must have role `user`"));
    }
    if last.content.trim().is_empty() {
        return Err(Error::invalid_input("message content must not be empty"));
    }

    let mut system = None;
    let mut carried = Vec::with_capacity(messages.len());
    for message in messages {
        if message.role == Role::System {
            if system.is_some() {
                return Err(Error::invalid_input("at most one system message is allowed"));
            }
            system = Some(message.content);
        } else if !message.content.trim().is_empty() {
            carried.push(message);
        }
    }
    Ok((system, carried, last.content))
}

fn reply_metadata(completion: &Completion) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("model".to_string(), json!(completion.model));
    metadata.insert("usage".to_string(), json!(completion.usage));
    metadata
}
