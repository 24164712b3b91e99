//! HTTP interface for the RAG core.
//!
//! Exposes the ingestion and query pipelines as a JSON API for the admin UI
//! and chat frontend collaborators.
//!
//! # Endpoints
//!
//! | Method   | Path                        | Description |
//! |----------|-----------------------------|-------------|
//! | `POST`   | `/documents`                | Ingest a PDF (base64 body) |
//! | `GET`    | `/documents`                | Admin listing with chunk counts |
//! | `POST`   | `/documents/:id/reprocess`  | Rebuild a document's chunks |
//! | `DELETE` | `/documents/:id`            | Delete a document and its chunks |
//! | `POST`   | `/ask`                      | Ask a question, get a cited answer |
//! | `GET`    | `/stats`                    | Knowledge-base statistics |
//! | `GET`    | `/health`                   | Health check (returns version) |
//!
//! # Error Contract
//!
//! Error responses use the envelope
//! `{ "error": { "code": "<kind>", "message": "..." } }` where `code` is the
//! machine-readable kind from the service error taxonomy.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::answer::{self, QueryResponse};
use crate::config::Config;
use crate::error::RagError;
use crate::ingest;
use crate::model_client::{self, ModelClient};
use crate::stats;
use crate::store::Store;
use crate::{db, migrate};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: Arc<Store>,
    client: ModelClient,
}

/// Start the HTTP server: connect the store, run migrations, spin up the
/// model client, and serve until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(&config.db.path).await?;
    migrate::run_migrations(&pool).await?;

    let provider = model_client::create_provider(&config.model)?;
    let client = ModelClient::new(provider, &config.model);

    let state = AppState {
        config: Arc::new(config.clone()),
        store: Arc::new(Store::new(pool)),
        client,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/documents", post(handle_upload).get(handle_list))
        .route("/documents/:id/reprocess", post(handle_reprocess))
        .route("/documents/:id", delete(handle_delete))
        .route("/ask", post(handle_ask))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    let bind_addr = config.server.bind.clone();
    tracing::info!(addr = %bind_addr, "RAG server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error mapping ============

struct ApiError(RagError);

impl From<RagError> for ApiError {
    fn from(e: RagError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RagError::Validation(_) => StatusCode::BAD_REQUEST,
            RagError::NotFound(_) => StatusCode::NOT_FOUND,
            RagError::ExtractFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RagError::ModelRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RagError::ModelQueueFull => StatusCode::SERVICE_UNAVAILABLE,
            RagError::ModelTimeout => StatusCode::GATEWAY_TIMEOUT,
            RagError::ModelTransient(_) => StatusCode::BAD_GATEWAY,
            RagError::Store(_) | RagError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Internal detail is logged, not leaked.
        let message = match &self.0 {
            RagError::Store(_) | RagError::Internal(_) => {
                tracing::error!(error = %self.0, "internal failure");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let body = serde_json::json!({
            "error": { "code": self.0.kind(), "message": message }
        });
        (status, Json(body)).into_response()
    }
}

// ============ Handlers ============

#[derive(Deserialize)]
struct UploadRequest {
    title: String,
    pdf_base64: String,
    tag_id: Option<String>,
    filename: Option<String>,
}

async fn handle_upload(
    State(state): State<AppState>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<ingest::IngestReport>, ApiError> {
    if request.title.trim().is_empty() {
        return Err(RagError::Validation("title is required".to_string()).into());
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(request.pdf_base64.as_bytes())
        .map_err(|e| RagError::Validation(format!("pdf_base64 is not valid base64: {e}")))?;

    let report = ingest::process_document(
        &state.store,
        &state.client,
        &state.config,
        &bytes,
        Some(request.title),
        request.tag_id,
        request.filename.as_deref(),
    )
    .await?;

    Ok(Json(report))
}

async fn handle_list(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let documents = state.store.list_documents_with_stats().await?;
    Ok(Json(serde_json::json!({ "documents": documents })))
}

async fn handle_reprocess(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ingest::IngestReport>, ApiError> {
    let report =
        ingest::reprocess_document(&state.store, &state.client, &state.config, &id).await?;
    Ok(Json(report))
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.delete_document(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    user_id: Option<String>,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let answer = answer::answer_question(
        &state.store,
        &state.client,
        &state.config,
        &request.question,
        request.user_id.as_deref(),
    )
    .await?;
    Ok(Json(QueryResponse::from_answer(answer)))
}

async fn handle_stats(
    State(state): State<AppState>,
) -> Result<Json<stats::KnowledgeBaseStats>, ApiError> {
    let stats = stats::knowledge_base_stats(&state.store).await?;
    Ok(Json(stats))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
