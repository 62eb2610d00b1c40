use std::sync::Arc;

use axum::{
    extract::{multipart::Multipart, DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use lexguard_core::{
    error::DocumentError, Document, DocumentList, Download, NewUpload, MAX_UPLOAD_BYTES,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{auth::AuthPrincipal, AppState};

/// Multipart framing allowance on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health
        .route("/api/health", get(health))
        // Documents
        .route("/api/documents", get(list_documents).post(upload_document))
        .route("/api/documents/events", get(sse_documents))
        .route(
            "/api/documents/:id",
            get(get_document).delete(delete_document),
        )
        .route("/api/documents/:id/download", get(download_document))
        .route("/api/documents/:id/report", get(download_report))
        .route("/api/documents/:id/chat", post(chat))
        // SSE logs
        .route("/api/logs", get(sse_logs))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES as usize + MULTIPART_OVERHEAD))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    BadRequest(String),
    Status(StatusCode, String),
    Document(DocumentError),
}

impl From<DocumentError> for ApiError {
    fn from(e: DocumentError) -> Self {
        ApiError::Document(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, "unauthorized", m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "validation", m),
            ApiError::Status(s, m) => (s, "request", m),
            ApiError::Document(e) => {
                let (status, kind) = match &e {
                    DocumentError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
                    DocumentError::Auth(_) => (StatusCode::FORBIDDEN, "auth"),
                    DocumentError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                    DocumentError::NotAnalyzed(_) => (StatusCode::CONFLICT, "not_analyzed"),
                    DocumentError::Provider(_) => (StatusCode::BAD_GATEWAY, "provider"),
                    DocumentError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
                    DocumentError::Delete(_) => (StatusCode::INTERNAL_SERVER_ERROR, "delete"),
                    DocumentError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
                };
                let message = if let DocumentError::Internal(inner) = &e {
                    tracing::error!("internal error: {inner:#}");
                    "internal error".to_string()
                } else {
                    e.to_string()
                };
                (status, kind, message)
            }
        };
        if status.is_server_error() {
            tracing::warn!("{} {kind}: {message}", status.as_u16());
        } else {
            tracing::debug!("{} {kind}: {message}", status.as_u16());
        }
        (status, Json(json!({ "error": message, "kind": kind }))).into_response()
    }
}

// ── Serializable wrappers ─────────────────────────────────────────────────

#[derive(Serialize)]
pub(crate) struct ListView {
    documents: Vec<Document>,
    current: Option<Document>,
    recent: Vec<Document>,
}

impl From<DocumentList> for ListView {
    fn from(list: DocumentList) -> Self {
        Self {
            current: list.current().cloned(),
            recent: list.recent().to_vec(),
            documents: list.documents,
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct ChatBody {
    pub question: String,
}

/// Header-safe filename for Content-Disposition.
fn disposition_name(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect()
}

fn attachment(dl: Download) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", disposition_name(&dl.filename));
    (
        [
            (header::CONTENT_TYPE, dl.mime_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        dl.bytes,
    )
        .into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime_s": state.start_time.elapsed().as_secs(),
        "analyzer": state.pipeline.analyzer.name(),
    }))
}

pub(crate) async fn list_documents(
    State(state): State<Arc<AppState>>,
    AuthPrincipal(principal): AuthPrincipal,
) -> Result<Json<ListView>, ApiError> {
    let list = state.pipeline.list(&principal)?;
    Ok(Json(list.into()))
}

pub(crate) async fn upload_document(
    State(state): State<Arc<AppState>>,
    AuthPrincipal(principal): AuthPrincipal,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Document>), ApiError> {
    let multipart_err = |e: axum::extract::multipart::MultipartError| {
        ApiError::Status(e.status(), e.body_text())
    };
    while let Some(field) = multipart.next_field().await.map_err(multipart_err)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await.map_err(multipart_err)?;
        let doc = state
            .pipeline
            .upload(
                &principal,
                NewUpload {
                    filename,
                    mime_type,
                    bytes: bytes.to_vec(),
                },
            )
            .await?;
        return Ok((StatusCode::CREATED, Json(doc)));
    }
    Err(ApiError::BadRequest("multipart field \"file\" is required".into()))
}

pub(crate) async fn get_document(
    State(state): State<Arc<AppState>>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(id): Path<String>,
) -> Result<Json<Document>, ApiError> {
    Ok(Json(state.pipeline.get(&principal, &id)?))
}

pub(crate) async fn delete_document(
    State(state): State<Arc<AppState>>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.pipeline.delete(&principal, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn download_document(
    State(state): State<Arc<AppState>>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let dl = state.pipeline.download(&principal, &id).await?;
    Ok(attachment(dl))
}

pub(crate) async fn download_report(
    State(state): State<Arc<AppState>>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let dl = state.pipeline.download_report(&principal, &id)?;
    Ok(attachment(dl))
}

pub(crate) async fn chat(
    State(state): State<Arc<AppState>>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(id): Path<String>,
    Json(body): Json<ChatBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reply = state.pipeline.chat(&principal, &id, &body.question)?;
    Ok(Json(json!({ "reply": reply })))
}

// SSE documents: current list snapshot, then a fresh snapshot after every change

pub(crate) async fn sse_documents(
    State(state): State<Arc<AppState>>,
    AuthPrincipal(principal): AuthPrincipal,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError>
{
    let mut watch_rx = state.pipeline.watch(&principal)?;
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        loop {
            let view: ListView = watch_rx.borrow_and_update().clone().into();
            let data = match serde_json::to_string(&view) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("serialize document list: {e}");
                    return;
                }
            };
            if tx.send(data).is_err() {
                return;
            }
            tokio::select! {
                _ = tx.closed() => return,
                changed = watch_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().event("documents").data(data)));
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    ))
}

// SSE logs: replays ring buffer history then streams live events

pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
    AuthPrincipal(principal): AuthPrincipal,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError>
{
    // log lines carry every owner's ids and filenames
    if !state.pipeline.config.is_admin(&principal.id) {
        tracing::warn!("{} denied access to the log stream", principal.id);
        return Err(DocumentError::Auth("log stream is restricted to administrators".into()).into());
    }
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    // Subscribe before snapshotting ring to avoid race
    let live_rx = state.log_tx.subscribe();
    let history: Vec<String> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        let mut live_rx = live_rx;
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    ))
}
