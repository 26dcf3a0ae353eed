use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use std::{collections::HashMap, sync::Arc};
use parking_lot::RwLock;
use serde_json::json;
use thiserror::Error;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};
use uuid::Uuid;
use chrono::{DateTime, Duration, Utc};

use crate::{
    data_uri::{DataUri, DataUriError},
    gemini::GenerationService,
    models::{SessionView, UploadRequest},
    workflow::{ImageSlot, Session, WorkflowError},
};

/// Data URIs of phone photos easily exceed axum's 2 MB default.
pub const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

pub type SessionStore = Arc<RwLock<HashMap<Uuid, Session>>>;

#[derive(Clone)]
pub struct AppState {
    pub store: SessionStore,
    pub generator: Arc<dyn GenerationService>,
}

impl AppState {
    pub fn new(generator: Arc<dyn GenerationService>) -> Self {
        Self { store: Arc::default(), generator }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("session not found")] SessionNotFound,
    #[error(transparent)] Workflow(#[from] WorkflowError),
    #[error("invalid image: {0}")] InvalidImage(#[from] DataUriError),
    #[error("internal error")] Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::SessionNotFound => StatusCode::NOT_FOUND,
            AppError::InvalidImage(_) => StatusCode::BAD_REQUEST,
            AppError::Workflow(e) => match e {
                WorkflowError::MissingImages => StatusCode::UNPROCESSABLE_ENTITY,
                WorkflowError::UnknownProposal(_) => StatusCode::NOT_FOUND,
                WorkflowError::Busy | WorkflowError::NoResult | WorkflowError::Stale => StatusCode::CONFLICT,
                WorkflowError::OptimizeFailed | WorkflowError::PreviewFailed => StatusCode::BAD_GATEWAY,
            },
            AppError::Internal(cause) => {
                tracing::error!("❌ Internal error: {}", cause);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/sessions/:id/portrait", put(upload_portrait))
        .route("/api/sessions/:id/product", put(upload_product))
        .route("/api/sessions/:id/optimize", post(optimize))
        .route("/api/sessions/:id/proposals/:proposal_id/preview", post(generate_preview))
        .route("/api/sessions/:id/proposals/:proposal_id/copy", post(copy_prompt))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        )
        .with_state(state)
}

/// Drops sessions with no call in flight that haven't changed for `ttl`. Returns how many went.
pub fn evict_idle_sessions(store: &SessionStore, now: DateTime<Utc>, ttl: Duration) -> usize {
    let mut guard = store.write();
    let before = guard.len();
    guard.retain(|_, session| !session.is_idle(now, ttl));
    let evicted = before - guard.len();
    if evicted > 0 {
        tracing::info!("🧹 Evicted {} idle sessions, {} remain", evicted, guard.len());
    }
    evicted
}

/// Runs `f` on the session under the write lock. Never hold the lock across an `.await`.
fn with_session<T>(
    store: &SessionStore,
    id: Uuid,
    f: impl FnOnce(&mut Session) -> Result<T, AppError>,
) -> Result<T, AppError> {
    let mut guard = store.write();
    let session = guard.get_mut(&id).ok_or(AppError::SessionNotFound)?;
    f(session)
}

async fn healthz() -> &'static str { "ok" }

pub async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<SessionView>) {
    let session = Session::new();
    let view = session.view(Utc::now());
    state.store.write().insert(session.id(), session);
    tracing::info!("🆕 Created session {}", view.id);
    (StatusCode::CREATED, Json(view))
}

pub async fn get_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<SessionView>, AppError> {
    with_session(&state.store, id, |s| Ok(Json(s.view(Utc::now()))))
}

pub async fn delete_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.store.write().remove(&id).ok_or(AppError::SessionNotFound)?;
    tracing::info!("🗑️ Deleted session {}", id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn upload_portrait(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<UploadRequest>,
) -> Result<Json<SessionView>, AppError> {
    upload(&state, id, ImageSlot::Portrait, body)
}

pub async fn upload_product(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<UploadRequest>,
) -> Result<Json<SessionView>, AppError> {
    upload(&state, id, ImageSlot::Product, body)
}

fn upload(state: &AppState, id: Uuid, slot: ImageSlot, body: UploadRequest) -> Result<Json<SessionView>, AppError> {
    let image: DataUri = body.image.parse()?;
    tracing::info!("📷 Session {} received {:?} image ({}, {} base64 chars)", id, slot, image.mime_type(), image.data().len());
    with_session(&state.store, id, |s| {
        s.upload(slot, image);
        Ok(Json(s.view(Utc::now())))
    })
}

pub async fn optimize(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<SessionView>, AppError> {
    let ticket = with_session(&state.store, id, |s| Ok(s.begin_optimize()?))?;
    tracing::info!("🚀 Session {} optimizing prompts", id);

    // The call runs on its own task so a dropped connection can't strand the in-flight marker.
    let AppState { store, generator } = state;
    let task = tokio::spawn(async move {
        let outcome = generator.optimize_prompts(&ticket.portrait, &ticket.product).await;
        with_session(&store, id, |s| {
            s.finish_optimize(ticket, outcome)?;
            Ok(s.view(Utc::now()))
        })
    });
    let view = task.await.map_err(|e| AppError::Internal(e.to_string()))??;
    Ok(Json(view))
}

pub async fn generate_preview(
    Path((id, proposal_id)): Path<(Uuid, Uuid)>,
    State(state): State<AppState>,
) -> Result<Json<SessionView>, AppError> {
    let ticket = with_session(&state.store, id, |s| Ok(s.begin_preview(proposal_id)?))?;
    tracing::info!("🎯 Session {} generating preview for proposal {}", id, proposal_id);

    let AppState { store, generator } = state;
    let task = tokio::spawn(async move {
        let outcome = generator.generate_preview(&ticket.portrait, &ticket.prompt).await;
        with_session(&store, id, |s| {
            s.finish_preview(ticket, outcome)?;
            Ok(s.view(Utc::now()))
        })
    });
    let view = task.await.map_err(|e| AppError::Internal(e.to_string()))??;
    Ok(Json(view))
}

pub async fn copy_prompt(
    Path((id, proposal_id)): Path<(Uuid, Uuid)>,
    State(state): State<AppState>,
) -> Result<String, AppError> {
    with_session(&state.store, id, |s| Ok(s.copy_prompt(proposal_id, Utc::now())?))
}
