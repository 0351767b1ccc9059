use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::error::{RagError, RagResult};
use crate::llm::Generator;
use crate::models::{
    DocumentRecord, ModelInfo, Namespace, ObjectEntry, ProcessFileRequest, QueryEvent,
    QueryRequest, UploadResponse,
};
use crate::rag::jobs::{IngestJob, IngestQueue};
use crate::rag::query::QueryService;
use crate::storage::{validate_filename, ObjectStore};

/// Which adapters are wired in; reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Backends {
    pub vector_index: String,
    pub catalog: String,
    pub object_store: String,
}

pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub catalog: Arc<dyn Catalog>,
    pub jobs: Arc<IngestQueue>,
    pub query: Arc<QueryService>,
    pub generator: Arc<Generator>,
    pub backends: Backends,
    pub keep_alive: Duration,
    pub max_upload_bytes: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    // CORS設定
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let body_limit = state.max_upload_bytes;

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/v1/models", get(list_models_handler))
        .route(
            "/api/v1/workspaces/:workspace_id/files",
            post(upload_file_handler).get(list_files_handler),
        )
        .route(
            "/api/v1/workspaces/:workspace_id/process-file",
            post(process_file_handler),
        )
        .route("/api/v1/workspaces/:workspace_id/query", post(query_handler))
        .route("/api/v1/jobs/:job_id", get(job_status_handler))
        .route("/api/v1/jobs/:job_id/retry", post(retry_job_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn log_failure(context: &'static str) -> impl Fn(RagError) -> RagError {
    move |e| {
        if e.status_code().is_server_error() {
            tracing::error!("{} failed: {}", context, e);
        } else {
            tracing::warn!("{} rejected: {}", context, e);
        }
        e
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "services": {
            "vector_index": state.backends.vector_index,
            "catalog": state.backends.catalog,
            "object_store": state.backends.object_store,
            "llm_providers": state.generator.configured_providers(),
        }
    }))
}

async fn list_models_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ModelInfo>> {
    Json(state.generator.models())
}

async fn upload_file_handler(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), RagError> {
    let namespace = Namespace::for_workspace(&workspace_id).map_err(log_failure("upload"))?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RagError::InvalidInput(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .ok_or_else(|| RagError::InvalidInput("file field has no filename".to_string()))
            .and_then(validate_filename)?
            .to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| RagError::InvalidInput(format!("failed to read upload: {}", e)))?;
        upload = Some((filename, content_type, bytes));
        break;
    }

    let (filename, content_type, bytes) =
        upload.ok_or_else(|| RagError::InvalidInput("no file uploaded".to_string()))?;
    if bytes.is_empty() {
        return Err(RagError::InvalidInput("uploaded file is empty".to_string()));
    }

    let size = bytes.len() as i64;
    let key = state
        .store
        .put(&namespace, &filename, bytes.to_vec())
        .await
        .map_err(log_failure("upload"))?;
    tracing::info!(workspace = %namespace, key = %key, size, "file uploaded");

    let record = DocumentRecord {
        workspace_id: namespace.as_str().to_string(),
        file_path: key.clone(),
        filename: filename.clone(),
        file_size: size,
        content_type,
        chunk_count: None,
        indexed_at: None,
        created_at: Utc::now(),
    };
    // アップロード自体は成功扱い
    let metadata_saved = match state.catalog.upsert_document(&record).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(workspace = %namespace, key = %key, "failed to save file metadata: {}", e);
            false
        }
    };

    let job = state
        .jobs
        .submit(namespace.as_str(), &key)
        .await
        .map_err(log_failure("upload"))?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            filename,
            key,
            workspace_id: namespace.as_str().to_string(),
            job_id: job.id,
            processing_status: "started".to_string(),
            metadata_saved,
        }),
    ))
}

async fn list_files_handler(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
) -> Result<Json<Vec<ObjectEntry>>, RagError> {
    let namespace = Namespace::for_workspace(&workspace_id)?;
    let entries = state
        .store
        .list(&namespace)
        .await
        .map_err(log_failure("list files"))?;
    Ok(Json(entries))
}

async fn process_file_handler(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    Json(request): Json<ProcessFileRequest>,
) -> Result<(StatusCode, Json<IngestJob>), RagError> {
    let namespace = Namespace::for_workspace(&workspace_id)?;
    let key = request.file_key.trim();
    if !key.starts_with(&format!("{}/", namespace)) {
        return Err(RagError::InvalidInput(format!(
            "file {} does not belong to workspace {}",
            key, namespace
        )));
    }

    let job = state
        .jobs
        .submit(namespace.as_str(), key)
        .await
        .map_err(log_failure("process file"))?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn job_status_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<IngestJob>, RagError> {
    Ok(Json(state.jobs.status(job_id).await?))
}

async fn retry_job_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<IngestJob>), RagError> {
    let job = state
        .jobs
        .retry(job_id)
        .await
        .map_err(log_failure("retry job"))?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    Json(request): Json<QueryRequest>,
) -> Result<Response, RagError> {
    if request.stream {
        let events = state
            .query
            .stream(&workspace_id, request)
            .await
            .map_err(log_failure("query"))?;
        return Ok(event_stream(events, state.keep_alive).into_response());
    }

    let answer = state
        .query
        .answer(&workspace_id, request)
        .await
        .map_err(log_failure("query"))?;
    Ok(Json(answer).into_response())
}

fn to_sse_event(event: &QueryEvent) -> RagResult<Event> {
    Event::default()
        .event(event.name())
        .json_data(event)
        .map_err(|e| RagError::InvalidInput(format!("failed to encode event: {}", e)))
}

fn event_stream(
    events: futures::stream::BoxStream<'static, QueryEvent>,
    keep_alive: Duration,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let stream = events.filter_map(|event| async move {
        match to_sse_event(&event) {
            Ok(sse_event) => Some(Ok(sse_event)),
            Err(e) => {
                tracing::error!(request = %event.id(), "{}", e);
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(keep_alive))
}
