//! HTTP Entity API
//!
//! Entities are returned with credential material redacted; status is
//! read-only and only changes through task completion.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use infraflow_controlplane::{ControlError, EntityService, ManifestReport};
use infraflow_core::{Entity, EntityDecl, ErrorKind, Spec, Task};
use std::sync::Arc;

pub struct AppState {
    pub service: EntityService,
    pub started_at: DateTime<Utc>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/entities", get(list_entities).post(create_entity))
        .route("/v1/entities/{id}", get(get_entity).delete(delete_entity))
        .route("/v1/entities/{id}/spec", put(update_spec))
        .route("/v1/entities/{id}/retry", post(retry_entity))
        .route("/v1/entities/{id}/purge", post(purge_entity))
        .route("/v1/entities/{id}/tasks", get(entity_tasks))
        .route("/v1/manifests", post(apply_manifest))
        .with_state(state)
}

/// Error body: `{"error": <kind>, "message": ...}`
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        status_for(self.kind)
    }
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.kind,
            "message": self.message,
        });
        (self.status(), Json(body)).into_response()
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::DependencyOrder | ErrorKind::ParentNotReady => {
            StatusCode::CONFLICT
        }
        ErrorKind::InvalidSpec | ErrorKind::UnsupportedVersion => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::CredentialError
        | ErrorKind::ExecutionError
        | ErrorKind::OutputParseError
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
    }))
}

async fn list_entities(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Entity>>> {
    let entities = state.service.list().await?;
    Ok(Json(entities.iter().map(Entity::redacted).collect()))
}

async fn create_entity(
    State(state): State<Arc<AppState>>,
    Json(decl): Json<EntityDecl>,
) -> ApiResult<(StatusCode, Json<Entity>)> {
    let entity = state.service.create(decl).await?;
    Ok((StatusCode::CREATED, Json(entity.redacted())))
}

async fn get_entity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Entity>> {
    Ok(Json(state.service.get(&id).await?.redacted()))
}

async fn update_spec(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(spec): Json<Spec>,
) -> ApiResult<Json<Entity>> {
    Ok(Json(state.service.update_spec(&id, spec).await?.redacted()))
}

async fn delete_entity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Entity>)> {
    let entity = state.service.request_delete(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(entity.redacted())))
}

async fn retry_entity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Entity>> {
    Ok(Json(state.service.retry(&id).await?.redacted()))
}

async fn purge_entity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Entity>> {
    Ok(Json(state.service.purge(&id).await?.redacted()))
}

async fn entity_tasks(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(state.service.history(&id).await?))
}

async fn apply_manifest(
    State(state): State<Arc<AppState>>,
    Json(decls): Json<Vec<EntityDecl>>,
) -> ApiResult<Json<ManifestReport>> {
    Ok(Json(state.service.apply_manifest(decls).await?))
}
