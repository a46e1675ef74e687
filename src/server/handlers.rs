//! HTTP handlers for the remote service.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;

use super::auth::AuthUser;
use super::storage::ServerStorageError;
use super::AppState;
use crate::sync::protocol::{
    CreateClientRequest, CreateClientResponse, CreatePatchesRequest, CreatePatchesResponse,
    CreateUserResponse, DeletePendingPatchesRequest, DeletePendingPatchesResponse, ErrorBody,
    GetPendingPatchesResponse, HeadResponse, HealthResponse, UpdateHeadRequest,
    UpdateHeadResponse, MAX_PENDING_LIMIT,
};

const DEFAULT_PENDING_LIMIT: usize = 100;

/// Error responses; rendered as `{error, message}` JSON.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str),
    Forbidden(i64),
    UserNotFound(i64),
    UserExists(i64),
    InvalidBody(String),
    Internal(ServerStorageError),
}

impl From<ServerStorageError> for ApiError {
    fn from(e: ServerStorageError) -> Self {
        match e {
            ServerStorageError::UserNotFound(id) => ApiError::UserNotFound(id),
            ServerStorageError::UnknownPatch(key) => {
                ApiError::InvalidBody(format!("Unknown patch {}", key))
            }
            other => ApiError::Internal(other),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidBody(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg.to_string()),
            ApiError::Forbidden(id) => (
                StatusCode::FORBIDDEN,
                "forbidden",
                format!("Token does not grant access to user {}", id),
            ),
            ApiError::UserNotFound(id) => (
                StatusCode::NOT_FOUND,
                "user_not_found",
                format!("User {} not found", id),
            ),
            ApiError::UserExists(id) => (
                StatusCode::CONFLICT,
                "user_exists",
                format!("User {} already exists", id),
            ),
            ApiError::InvalidBody(msg) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_body", msg),
            ApiError::Internal(e) => {
                tracing::error!("storage failure: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "Internal storage error".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorBody {
                error: error.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

/// Health check endpoint (no auth required)
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Creates the token's user.
#[tracing::instrument(skip_all, fields(user_id))]
pub async fn create_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<(StatusCode, Json<CreateUserResponse>), ApiError> {
    tracing::Span::current().record("user_id", user.user_id);
    if !state.storage.create_user(user.user_id).await? {
        return Err(ApiError::UserExists(user.user_id));
    }
    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse {
            user_id: user.user_id,
        }),
    ))
}

#[tracing::instrument(skip_all, fields(user_id))]
pub async fn create_client(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(user_id): Path<i64>,
    body: Result<Json<CreateClientRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateClientResponse>), ApiError> {
    tracing::Span::current().record("user_id", user_id);
    user.authorize(user_id)?;
    let Json(body) = body?;

    let client_id = state.storage.create_client(user_id, &body.name).await?;
    Ok((StatusCode::CREATED, Json(CreateClientResponse { client_id })))
}

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    limit: Option<usize>,
}

#[tracing::instrument(skip_all, fields(user_id, client_id))]
pub async fn get_pending_patches(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((user_id, client_id)): Path<(i64, i64)>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<GetPendingPatchesResponse>, ApiError> {
    let span = tracing::Span::current();
    span.record("user_id", user_id);
    span.record("client_id", client_id);
    user.authorize(user_id)?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_PENDING_LIMIT)
        .clamp(1, MAX_PENDING_LIMIT);
    let patches = state
        .storage
        .pending_patches(user_id, client_id, limit)
        .await?;
    tracing::debug!(count = patches.len(), "delivering pending patches");
    Ok(Json(GetPendingPatchesResponse { patches }))
}

#[tracing::instrument(skip_all, fields(user_id, client_id))]
pub async fn delete_pending_patches(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((user_id, client_id)): Path<(i64, i64)>,
    body: Result<Json<DeletePendingPatchesRequest>, JsonRejection>,
) -> Result<Json<DeletePendingPatchesResponse>, ApiError> {
    let span = tracing::Span::current();
    span.record("user_id", user_id);
    span.record("client_id", client_id);
    user.authorize(user_id)?;
    let Json(body) = body?;

    let deleted = state
        .storage
        .delete_pending_patches(user_id, client_id, &body.patch_keys)
        .await?;
    Ok(Json(DeletePendingPatchesResponse { deleted }))
}

#[tracing::instrument(skip_all, fields(user_id))]
pub async fn get_head(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(user_id): Path<i64>,
) -> Result<Json<HeadResponse>, ApiError> {
    tracing::Span::current().record("user_id", user_id);
    user.authorize(user_id)?;
    Ok(Json(state.storage.head(user_id).await?))
}

#[tracing::instrument(skip_all, fields(user_id))]
pub async fn update_head(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(user_id): Path<i64>,
    body: Result<Json<UpdateHeadRequest>, JsonRejection>,
) -> Result<Json<UpdateHeadResponse>, ApiError> {
    tracing::Span::current().record("user_id", user_id);
    user.authorize(user_id)?;
    let Json(body) = body?;

    let updated = state
        .storage
        .update_head(user_id, body.patch_key, body.header_if_match)
        .await?;
    Ok(Json(UpdateHeadResponse { updated }))
}

#[tracing::instrument(skip_all, fields(user_id))]
pub async fn create_patches(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(user_id): Path<i64>,
    body: Result<Json<CreatePatchesRequest>, JsonRejection>,
) -> Result<Json<CreatePatchesResponse>, ApiError> {
    tracing::Span::current().record("user_id", user_id);
    user.authorize(user_id)?;
    let Json(body) = body?;

    let inserted = state.storage.create_patches(user_id, &body.patches).await?;
    Ok(Json(CreatePatchesResponse { inserted }))
}
