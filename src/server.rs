//! HTTP gateway.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/process_document` | Classify, de-duplicate and extract one image (alias `/process_document`) |
//! | `POST` | `/v1/ocr/{document_type}` | Extraction only for a known type (alias `/ocr/{document_type}`) |
//! | `GET`  | `/health` | Liveness, versions and index size |
//!
//! Uploads are `multipart/form-data` with one file part named `image`.
//!
//! # Error Contract
//!
//! ```json
//! { "detail": "Upload exceeds 10485760 bytes", "code": "payload_too_large" }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request` | 400 |
//! | `not_found` | 404 |
//! | `payload_too_large` | 413 |
//! | `unsupported_format` | 415 |
//! | `internal` | 500 |
//! | `classification_unavailable` | 503 |
//! | `timeout` | 504 |
//!
//! Details are written for clients; internal error text only reaches the log.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; the upload form is
//! served from a different origin.

use anyhow::Context;
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use docsift_core::error::ProcessError;
use docsift_core::models::{Document, DocumentType, ProcessingResult};

use crate::config::{Config, ServerConfig};
use crate::pipeline::{Pipeline, Services};

/// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
    max_upload_bytes: usize,
    allowed_content_types: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(pipeline: Pipeline, server: &ServerConfig) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            max_upload_bytes: server.max_upload_bytes,
            allowed_content_types: Arc::new(
                server
                    .allowed_content_types
                    .iter()
                    .map(|t| t.to_ascii_lowercase())
                    .collect(),
            ),
        }
    }
}

/// Build services from `config` and serve until interrupted.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Services::from_config(config).await?;
    let pipeline = Pipeline::new(services, config.pipeline.timeout());
    let state = AppState::new(pipeline, &config.server);

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;

    serve(listener, state).await
}

/// Serve on an already-bound listener. Returns after Ctrl-C.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "docsift listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES);

    Router::new()
        .route("/v1/process_document", post(handle_process_document))
        .route("/process_document", post(handle_process_document))
        .route("/v1/ocr/{document_type}", post(handle_ocr))
        .route("/ocr/{document_type}", post(handle_ocr))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
    code: &'static str,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    detail: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            code,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            detail: self.detail,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(detail: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", detail)
}

fn payload_too_large(limit: usize) -> AppError {
    AppError::new(
        StatusCode::PAYLOAD_TOO_LARGE,
        "payload_too_large",
        format!("Upload exceeds {} bytes", limit),
    )
}

fn unsupported_format(detail: impl Into<String>) -> AppError {
    AppError::new(
        StatusCode::UNSUPPORTED_MEDIA_TYPE,
        "unsupported_format",
        detail,
    )
}

impl From<ProcessError> for AppError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::UnsupportedFormat(_) => {
                unsupported_format("The upload is not a readable PNG or JPEG image")
            }
            ProcessError::ImageTooLarge(_) => AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                "The image dimensions exceed the accepted maximum",
            ),
            ProcessError::ClassificationUnavailable(_) => AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "classification_unavailable",
                "Document classification is temporarily unavailable",
            ),
            ProcessError::Timeout(_) => AppError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                "Processing did not finish in time",
            ),
            ProcessError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error while processing upload");
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "Internal server error",
                )
            }
        }
    }
}

// ============ Upload handling ============

struct Upload {
    bytes: Vec<u8>,
    content_type: String,
}

fn multipart_error(err: MultipartError, limit: usize) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        payload_too_large(limit)
    } else {
        tracing::debug!(error = %err.body_text(), "rejecting malformed multipart body");
        bad_request("Malformed multipart body")
    }
}

/// Drop parameters and normalize case: `Image/PNG; x=y` → `image/png`.
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Pull the single `image` part out of the body, enforcing size and type.
async fn read_upload(state: &AppState, mut multipart: Multipart) -> Result<Upload, AppError> {
    let limit = state.max_upload_bytes;
    let mut upload: Option<Upload> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        if field.name() != Some("image") {
            continue;
        }
        if upload.is_some() {
            return Err(bad_request("Exactly one 'image' part is allowed"));
        }

        let content_type = field.content_type().map(essence).unwrap_or_default();
        if !content_type.is_empty() && !state.allowed_content_types.contains(&content_type) {
            return Err(unsupported_format(format!(
                "Content type '{}' is not accepted",
                content_type
            )));
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error(e, limit))?;
        if bytes.len() > limit {
            return Err(payload_too_large(limit));
        }

        upload = Some(Upload {
            bytes: bytes.to_vec(),
            content_type,
        });
    }

    let upload = upload.ok_or_else(|| bad_request("Missing multipart part 'image'"))?;
    if upload.bytes.is_empty() {
        return Err(bad_request("The 'image' part is empty"));
    }
    Ok(upload)
}

// ============ POST /v1/process_document ============

async fn handle_process_document(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ProcessingResult>, AppError> {
    let upload = read_upload(&state, multipart).await?;
    let document = Document::new(upload.bytes, upload.content_type);
    tracing::debug!(
        document_id = %document.id,
        content_hash = %document.content_hash,
        mime_type = %document.mime_type,
        bytes = document.bytes.len(),
        "upload received"
    );

    let result = state.pipeline.process(document).await?;
    Ok(Json(result))
}

// ============ POST /v1/ocr/{document_type} ============

async fn handle_ocr(
    State(state): State<AppState>,
    Path(document_type): Path<String>,
    multipart: Multipart,
) -> Result<Json<serde_json::Map<String, serde_json::Value>>, AppError> {
    let doc_type = DocumentType::from_slug(&document_type).ok_or_else(|| {
        AppError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Unknown document type '{}'", document_type),
        )
    })?;

    let upload = read_upload(&state, multipart).await?;
    let fields = state.pipeline.extract_only(&upload.bytes, doc_type).await?;

    Ok(Json(
        fields
            .into_iter()
            .map(|(name, value)| {
                let value = value.map_or(serde_json::Value::Null, serde_json::Value::String);
                (name, value)
            })
            .collect(),
    ))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    model_version: Option<String>,
    classifier_ready: bool,
    /// `None` when the index cannot be reached.
    index_records: Option<usize>,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let services = state.pipeline.services();
    let model_version = services.classifier.model_version().map(str::to_string);
    let index_records = services.index.len().await.ok();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        classifier_ready: model_version.is_some(),
        model_version,
        index_records,
    })
}
