use crate::engine::{EngineError, EngineHandle};
use crate::flow::{self, BatchRegistry, PendingUpload, UploadBatch};
use crate::page::{self, GalleryView};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use snapfind_core::Device;
use snapfind_store::{FileStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: FileStore,
    pub engine: EngineHandle,
    pub batches: Arc<BatchRegistry>,
    pub default_device: Device,
}

/// Failures surfaced to the browser as an error page.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    ModelUnavailable(EngineError),
    #[error(transparent)]
    Engine(EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::ModelUnavailable { .. } => AppError::ModelUnavailable(e),
            other => AppError::Engine(other),
        }
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Store(StoreError::InvalidName(_)) => StatusCode::BAD_REQUEST,
            AppError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Html(page::error(&self.to_string()))).into_response()
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(gallery))
        .route("/upload", post(upload))
        .route("/batches/{id}/{index}", get(batch_item))
        .route("/batches/{id}/continue", post(continue_batch))
        .route("/batches/{id}/discard", post(discard_batch))
        .route("/images/{name}", get(image_inline))
        .route("/images/{name}/download", get(image_download))
        .route("/images/{name}/delete", post(delete_image))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct GalleryQuery {
    #[serde(default)]
    q: String,
    device: Option<String>,
}

/// Posted by the delete and discard forms so the gallery they return to keeps
/// the search and the device selection.
#[derive(Debug, Default, Deserialize)]
struct ReturnForm {
    #[serde(default)]
    q: String,
    device: Option<String>,
}

fn pick_device(raw: Option<&str>, fallback: Device) -> Device {
    raw.and_then(|d| d.parse().ok()).unwrap_or(fallback)
}

fn render_gallery(
    state: &AppState,
    query: &str,
    device: Device,
    report: Option<&flow::BatchReport>,
) -> Result<Html<String>, AppError> {
    let images = snapfind_store::filter(query, state.store.list()?);
    Ok(Html(page::gallery(&GalleryView {
        query,
        device,
        images: &images,
        report,
    })))
}

async fn gallery(
    State(state): State<AppState>,
    Query(params): Query<GalleryQuery>,
) -> Result<Html<String>, AppError> {
    let device = pick_device(params.device.as_deref(), state.default_device);
    render_gallery(&state, &params.q, device, None)
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Html<String>, AppError> {
    let mut device = state.default_device;
    let mut items = Vec::new();
    let mut rejected = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("malformed upload: {e}")))?
    {
        let field_name = field.name().map(str::to_owned);
        match field_name.as_deref() {
            Some("device") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("malformed upload: {e}")))?;
                device = raw
                    .parse()
                    .map_err(|e: snapfind_core::ParseDeviceError| AppError::BadRequest(e.to_string()))?;
            }
            Some("files") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("malformed upload: {e}")))?;
                // Browsers send one empty part when no file was chosen.
                if file_name.is_empty() && bytes.is_empty() {
                    continue;
                }
                if flow::is_accepted_upload(&file_name) {
                    items.push(PendingUpload {
                        file_name,
                        bytes: bytes.to_vec(),
                    });
                } else {
                    rejected.push(file_name);
                }
            }
            _ => {}
        }
    }

    if !rejected.is_empty() {
        return Err(AppError::BadRequest(format!(
            "only .jpg, .jpeg and .png files are accepted (rejected: {})",
            rejected.join(", ")
        )));
    }
    if items.is_empty() {
        return Err(AppError::BadRequest("no files selected".into()));
    }

    let batch = UploadBatch::new(device, items);
    let html = page::preview(&batch);
    tracing::info!(batch = %batch.id, files = batch.items.len(), %device, "upload received");
    state.batches.insert(batch).await;
    Ok(Html(html))
}

async fn batch_item(
    State(state): State<AppState>,
    Path((id, index)): Path<(Uuid, usize)>,
) -> Result<Response, AppError> {
    let item = state
        .batches
        .item(id, index)
        .await
        .ok_or_else(|| AppError::NotFound(format!("no pending upload {id}/{index}")))?;
    Ok(([(header::CONTENT_TYPE, content_type(&item.file_name))], item.bytes).into_response())
}

async fn continue_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Html<String>, AppError> {
    let batch = state
        .batches
        .take(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("no pending upload batch {id}")))?;
    let device = batch.device;

    match flow::process_batch(batch, &state.engine, &state.store).await {
        Ok(report) => render_gallery(&state, "", device, Some(&report)),
        Err((batch, e)) => {
            // Keep the upload pending so it can be retried or discarded.
            state.batches.insert(batch).await;
            Err(e.into())
        }
    }
}

async fn discard_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Form(form): Form<ReturnForm>,
) -> Redirect {
    let discarded = state.batches.take(id).await;
    let fallback = discarded.as_ref().map_or(state.default_device, |b| b.device);
    if discarded.is_some() {
        tracing::info!(batch = %id, "batch discarded");
    }
    let device = pick_device(form.device.as_deref(), fallback);
    Redirect::to(&page::gallery_url("", device))
}

async fn image_inline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let bytes = state.store.read(&name)?;
    Ok(([(header::CONTENT_TYPE, content_type(&name))], bytes).into_response())
}

async fn image_download(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let bytes = state.store.read(&name)?;
    let disposition = format!("attachment; filename=\"{name}\"");
    Ok((
        [
            (header::CONTENT_TYPE, content_type(&name).to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

async fn delete_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Form(form): Form<ReturnForm>,
) -> Result<Redirect, AppError> {
    state.store.delete(&name)?;
    let device = pick_device(form.device.as_deref(), state.default_device);
    Ok(Redirect::to(&page::gallery_url(&form.q, device)))
}

async fn status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let images = state.store.list()?.len();
    let loaded = state.engine.loaded_devices().await?;
    Ok(Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "store_dir": state.store.dir().display().to_string(),
        "images": images,
        "pending_batches": state.batches.len().await,
        "default_device": state.default_device,
        "loaded_devices": loaded,
    })))
}

fn content_type(file_name: &str) -> &'static str {
    let is_png = file_name
        .rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("png"));
    if is_png {
        "image/png"
    } else {
        "image/jpeg"
    }
}
