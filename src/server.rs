//! # HTTP surface
//!
//! An axum [`Router`] over the chat gateway, the session store and the retrieval service.
//!
//! | Method | Path | Handler |
//! |---|---|---|
//! | GET | `/health` | liveness plus whether an index is loaded |
//! | POST | `/api/chat` | one chat turn from a message list |
//! | POST | `/api/chat/simple` | one chat turn from query parameters |
//! | GET, POST | `/api/chat/sessions` | list / create sessions |
//! | GET, DELETE | `/api/chat/sessions/{id}` | read / delete a session |
//! | PATCH | `/api/chat/sessions/{id}/title` | rename |
//! | DELETE | `/api/chat/sessions/{id}/messages` | clear history |
//! | GET | `/api/search/vector` | similarity search |
//! | POST | `/api/search/vectorize` | rebuild the index |
//!
//! `sourcePath` and `outputPath` on the vectorize route are resolved inside the directory of the
//! served index; absolute paths and `..` are rejected.
//!
//! JSON bodies use camelCase; query parameters accept both camelCase and snake_case. Every
//! failure is a JSON body `{errorCode, message}` with the status from [`ApiError`]; a turn that
//! completed but could not be saved also carries `turnSaved: false` and the `reply`.

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::{
    completion::HttpCompletionProvider,
    config::ShopscopeConfig,
    embedding::{EmbeddingProvider, HttpEmbeddingProvider},
    error::{Error, ProviderErrorKind, Result},
    gateway::{ChatGateway, ChatOptions, ChatReply},
    models::{ChatMessage, PromptMessage, Role, SessionSummary},
    retrieval::{DEFAULT_TOP_K, RetrievalService, SearchResult, VectorizeReport},
    session_store::SessionStore,
    template::ChatTemplate,
    vector_store::IndexHandle,
    vectorizer::Vectorizer,
};

/// Shared services, built once at startup and cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ChatGateway>,
    pub retrieval: Arc<RetrievalService>,
}

impl AppState {
    pub fn new(gateway: Arc<ChatGateway>, retrieval: Arc<RetrievalService>) -> Self {
        Self { gateway, retrieval }
    }

    /// Wire the HTTP providers, the session store and the served index from `config`.
    pub async fn from_config(config: &ShopscopeConfig, template: ChatTemplate) -> Result<Self> {
        let gateway = build_gateway(config, template).await?;
        let retrieval = build_retrieval(config)?;
        Ok(Self::new(Arc::new(gateway), Arc::new(retrieval)))
    }

    fn store(&self) -> &SessionStore {
        self.gateway.store()
    }
}

/// Open the session store and connect the completion provider.
pub async fn build_gateway(config: &ShopscopeConfig, template: ChatTemplate) -> Result<ChatGateway> {
    let store = Arc::new(SessionStore::open(&config.storage.chat_history_dir).await?);
    let completion = Arc::new(HttpCompletionProvider::new(config.chat_endpoint())?);
    Ok(
        ChatGateway::new(store, completion, config.context_assembler(), template)
            .with_option_defaults(config.completion_defaults(), config.max_tokens_limit),
    )
}

/// Load the served index and connect the embedding provider.
pub fn build_retrieval(config: &ShopscopeConfig) -> Result<RetrievalService> {
    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::new(HttpEmbeddingProvider::new(config.embedding_endpoint())?);
    let vectorizer = Vectorizer::new(
        Arc::clone(&embedder),
        config.vectorizer.batch_size,
        config.retry_policy(),
    );
    let index = Arc::new(IndexHandle::open(&config.storage.vector_index_path));
    Ok(RetrievalService::new(
        index,
        embedder,
        vectorizer,
        &config.storage.source_path,
    ))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/chat/simple", post(chat_simple))
        .route("/api/chat/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/chat/sessions/{id}",
            get(get_session).delete(delete_session),
        )
        .route("/api/chat/sessions/{id}/title", patch(rename_session))
        .route("/api/chat/sessions/{id}/messages", axum::routing::delete(clear_messages))
        .route("/api/search/vector", get(search))
        .route("/api/search/vectorize", post(vectorize))
        .with_state(state)
}

/// Bind `addr` and serve until Ctrl-C.
pub async fn serve(state: AppState, addr: &str) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        })
        .await
}

// ---- request / response shapes --------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    index_built: bool,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    role: Role,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    messages: Vec<MessageBody>,
    temperature: Option<f64>,
    #[serde(alias = "max_tokens")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatQuery {
    #[serde(alias = "session_id")]
    session_id: Option<String>,
    #[serde(alias = "save_history")]
    save_history: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimpleChatQuery {
    message: String,
    #[serde(alias = "system_prompt")]
    system_prompt: Option<String>,
    #[serde(alias = "session_id")]
    session_id: Option<String>,
    #[serde(alias = "save_history")]
    save_history: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimpleChatResponse {
    reply: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SessionListResponse {
    sessions: Vec<SessionSummary>,
    total: usize,
}

#[derive(Debug, Default, Deserialize)]
struct TitleQuery {
    title: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: String,
    session: SessionSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionDetailResponse {
    session: SessionSummary,
    messages: Vec<ChatMessage>,
    message_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionChangeResponse {
    success: bool,
    session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<SessionSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchQuery {
    query: String,
    #[serde(alias = "top_k")]
    top_k: Option<i64>,
    #[serde(alias = "min_similarity")]
    min_similarity: Option<f64>,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    query: String,
    results: Vec<SearchResult>,
    total: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VectorizeQuery {
    #[serde(alias = "source_path")]
    source_path: Option<PathBuf>,
    #[serde(alias = "output_path")]
    output_path: Option<PathBuf>,
}

// ---- handlers --------------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        index_built: state.retrieval.is_built(),
    })
}

async fn chat(
    State(state): State<AppState>,
    query: std::result::Result<Query<ChatQuery>, QueryRejection>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> std::result::Result<Json<ChatReply>, ApiError> {
    let Query(query) = query?;
    let Json(request) = payload?;
    let messages = request
        .messages
        .into_iter()
        .map(|m| PromptMessage::new(m.role, m.content))
        .collect();
    let options = ChatOptions {
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    };
    let reply = state
        .gateway
        .send(
            query.session_id.as_deref(),
            messages,
            options,
            query.save_history.unwrap_or(true),
        )
        .await?;
    Ok(Json(reply))
}

async fn chat_simple(
    State(state): State<AppState>,
    query: std::result::Result<Query<SimpleChatQuery>, QueryRejection>,
) -> std::result::Result<Json<SimpleChatResponse>, ApiError> {
    let Query(query) = query?;
    let reply = state
        .gateway
        .send_simple(
            &query.message,
            query.system_prompt.as_deref(),
            query.session_id.as_deref(),
            query.save_history.unwrap_or(true),
        )
        .await?;
    Ok(Json(SimpleChatResponse {
        reply: reply.reply,
        session_id: reply.session_id,
    }))
}

async fn list_sessions(
    State(state): State<AppState>,
) -> std::result::Result<Json<SessionListResponse>, ApiError> {
    let sessions = state.store().list_sessions().await?;
    Ok(Json(SessionListResponse {
        total: sessions.len(),
        sessions,
    }))
}

async fn create_session(
    State(state): State<AppState>,
    query: std::result::Result<Query<TitleQuery>, QueryRejection>,
) -> std::result::Result<Json<CreateSessionResponse>, ApiError> {
    let Query(query) = query?;
    let session = state.store().create_session(query.title.as_deref()).await?;
    Ok(Json(CreateSessionResponse {
        session_id: session.id.clone(),
        session: session.summary(),
    }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<SessionDetailResponse>, ApiError> {
    let session = state.store().get_session(&id).await?;
    Ok(Json(SessionDetailResponse {
        session: session.summary(),
        message_count: session.message_count(),
        messages: session.messages,
    }))
}

async fn rename_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: std::result::Result<Query<TitleQuery>, QueryRejection>,
) -> std::result::Result<Json<SessionSummary>, ApiError> {
    let Query(query) = query?;
    let title = query
        .title
        .ok_or_else(|| Error::invalid_input("query parameter `title` is required"))?;
    let summary = state.store().rename_session(&id, &title).await?;
    Ok(Json(summary))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<SessionChangeResponse>, ApiError> {
    state.store().delete_session(&id).await?;
    Ok(Json(SessionChangeResponse {
        success: true,
        session_id: id,
        session: None,
    }))
}

async fn clear_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<SessionChangeResponse>, ApiError> {
    let summary = state.store().clear_messages(&id).await?;
    Ok(Json(SessionChangeResponse {
        success: true,
        session_id: id,
        session: Some(summary),
    }))
}

async fn search(
    State(state): State<AppState>,
    query: std::result::Result<Query<SearchQuery>, QueryRejection>,
) -> std::result::Result<Json<SearchResponse>, ApiError> {
    let Query(query) = query?;
    let results = state
        .retrieval
        .search(
            &query.query,
            query.top_k.unwrap_or(DEFAULT_TOP_K),
            query.min_similarity.unwrap_or(0.0),
        )
        .await?;
    Ok(Json(SearchResponse {
        query: query.query,
        total: results.len(),
        results,
    }))
}

async fn vectorize(
    State(state): State<AppState>,
    query: std::result::Result<Query<VectorizeQuery>, QueryRejection>,
) -> std::result::Result<Json<VectorizeReport>, ApiError> {
    let Query(query) = query?;
    let resolve =
        |path: Option<PathBuf>| path.map(|p| state.retrieval.resolve_data_path(&p)).transpose();
    let source = resolve(query.source_path)?;
    let output = resolve(query.output_path)?;
    let report = state
        .retrieval
        .vectorize(source.as_deref(), output.as_deref())
        .await?;
    Ok(Json(report))
}

// ---- errors ---------------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    turn_saved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<String>,
}

/// A crate [`Error`] (or an extractor rejection) on its way to becoming a JSON response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error_code: String,
    message: String,
    reply: Option<String>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            Error::ProviderFailure {
                kind: ProviderErrorKind::Timeout,
                ..
            } => StatusCode::GATEWAY_TIMEOUT,
            Error::ProviderFailure { .. } => StatusCode::BAD_GATEWAY,
            Error::PersistenceFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::IndexNotBuilt { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            error!("Request failed: {}", err);
        }
        let reply = match &err {
            Error::PersistenceFailure { unsaved_reply, .. } => unsaved_reply.clone(),
            _ => None,
        };
        Self {
            status,
            error_code: err.error_code().to_string(),
            message: err.to_string(),
            reply,
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Error::invalid_input(rejection.body_text()).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Error::invalid_input(rejection.body_text()).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error_code: self.error_code,
            message: self.message,
            turn_saved: self.reply.is_some().then_some(false),
            reply: self.reply,
        };
        (self.status, Json(body)).into_response()
    }
}
