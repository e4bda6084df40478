//! # Completion providers
//!
//! [`CompletionProvider`] sends an assembled context to a chat model and returns one reply.
//! [`HttpCompletionProvider`] speaks the OpenAI compatible `POST {api_base}/chat/completions`
//! protocol with the `async_openai` request and response types, and reads the reply from
//! `choices[0].message.content`.
//!
//! Completion calls are never retried: a retried request that actually reached the model
//! could produce a second, different reply for the same turn.

use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestAssistantMessageContent,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Error, ProviderErrorKind, Result},
    models::{PromptMessage, Role, Usage},
    provider::{self, Endpoint},
};

/// Sampling options passed through to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOptions {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2000,
        }
    }
}

impl CompletionOptions {
    /// Check the options against what providers accept.
    ///
    /// # Errors
    /// [`Error::InvalidInput`] when `temperature` is outside `[0, 2]` or `max_tokens` is outside
    /// `1..=max_tokens_limit`.
    pub fn validate(&self, max_tokens_limit: u32) -> Result<()> {
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::invalid_input(format!(
                "temperature must be between 0 and 2, got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 || self.max_tokens > max_tokens_limit {
            return Err(Error::invalid_input(format!(
                "maxTokens must be between 1 and {max_tokens_limit}, got {}",
                self.max_tokens
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<PromptMessage>,
    pub options: CompletionOptions,
}

/// The model's answer for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    /// Model name as reported by the provider.
    pub model: String,
    pub usage: Usage,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// OpenAI compatible chat completions over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCompletionProvider {
    endpoint: Endpoint,
    client: Client,
}

impl HttpCompletionProvider {
    pub fn new(endpoint: Endpoint) -> Result<Self> {
        let client = provider::http_client(endpoint.timeout)?;
        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    fn model(&self) -> &str {
        &self.endpoint.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = chat_request(&self.endpoint.model, request)?;
        let response: CreateChatCompletionResponse = provider::post_json(
            &self.client,
            &self.endpoint,
            "chat/completions",
            &body,
            "chat completion",
        )
        .await?;
        let completion = parse_completion_response(response, &self.endpoint.model)?;
        debug!(
            "Completion from {}: {} tokens",
            completion.model, completion.usage.total_tokens
        );
        Ok(completion)
    }
}

#[allow(deprecated)]
fn to_request_message(message: &PromptMessage) -> ChatCompletionRequestMessage {
    let content = message.content.clone();
    match message.role {
        Role::System => ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
            content: ChatCompletionRequestSystemMessageContent::Text(content),
            name: None,
        }),
        Role::User => ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
            content: ChatCompletionRequestUserMessageContent::Text(content),
            name: None,
        }),
        Role::Assistant => {
            ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                content: Some(ChatCompletionRequestAssistantMessageContent::Text(content)),
                name: None,
                refusal: None,
                audio: None,
                tool_calls: None,
                function_call: None,
            })
        }
    }
}

#[allow(deprecated)]
fn chat_request(model: &str, request: &CompletionRequest) -> Result<CreateChatCompletionRequest> {
    let messages: Vec<ChatCompletionRequestMessage> =
        request.messages.iter().map(to_request_message).collect();
    CreateChatCompletionRequestArgs::default()
        .model(model)
        .messages(messages)
        .temperature(request.options.temperature as f32)
        .max_tokens(request.options.max_tokens)
        .stream(false)
        .build()
        .map_err(|e| Error::invalid_input(format!("chat request: {e}")))
}

fn parse_completion_response(
    response: CreateChatCompletionResponse,
    fallback_model: &str,
) -> Result<Completion> {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| {
            Error::provider(
                ProviderErrorKind::InvalidResponse,
                "completion response has no choices[0].message.content",
            )
        })?;
    if content.trim().is_empty() {
        return Err(Error::provider(
            ProviderErrorKind::InvalidResponse,
            "completion response content is empty",
        ));
    }

    let model = if response.model.is_empty() {
        fallback_model.to_string()
    } else {
        response.model
    };
    let usage = response
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        })
        .unwrap_or_default();

    Ok(Completion {
        content,
        model,
        usage,
    })
}
