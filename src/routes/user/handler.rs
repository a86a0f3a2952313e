use axum::{
    extract::{Extension, Json, Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};

use super::model::{CreateUserRequest, CreateUserResponse, MessageResponse, attach_emails};
use crate::AppState;
use crate::error::{ApiError, ApiResult};
use crate::middleware::AdminContext;
use crate::platform::{NewProfile, Presence};

const MISSING_FIELDS: &str = "Email, password, and username are required";

#[axum::debug_handler]
pub async fn list_users(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let profiles = state.platform.profiles.list_profiles().await.map_err(|e| {
        tracing::error!("Failed to fetch profiles: {}", e);
        ApiError::Upstream(format!("Error fetching profiles: {}", e))
    })?;

    let identities = state.platform.identity.admin_list_users().await.map_err(|e| {
        tracing::error!("Failed to fetch identities: {}", e);
        ApiError::Upstream(format!("Error fetching users: {}", e))
    })?;

    Ok((StatusCode::OK, Json(attach_emails(profiles, &identities))))
}

/// 先创建身份再写资料；资料写入失败时删除刚创建的身份
#[axum::debug_handler]
pub async fn create_user(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload.map_err(|rejection| {
        tracing::debug!("Rejected create-user body: {}", rejection.body_text());
        ApiError::Validation(MISSING_FIELDS.into())
    })?;
    let (email, password, username) = req
        .required_fields()
        .ok_or_else(|| ApiError::Validation(MISSING_FIELDS.into()))?;

    let identity = state
        .platform
        .identity
        .admin_create_user(email, password)
        .await
        .map_err(|e| {
            tracing::error!("Failed to create identity for {}: {}", email, e);
            ApiError::Upstream(e.to_string())
        })?;

    let profile = NewProfile {
        id: identity.id.clone(),
        username: username.to_string(),
        status: Presence::Offline,
    };
    if let Err(e) = state.platform.profiles.insert_profile(&profile).await {
        tracing::error!("Failed to create profile for {}: {}", identity.id, e);
        match state.platform.identity.admin_delete_user(&identity.id).await {
            Ok(()) => tracing::info!("Rolled back identity {}", identity.id),
            Err(undo) => {
                tracing::error!("Failed to roll back identity {}: {}", identity.id, undo)
            }
        }
        return Err(ApiError::Upstream(e.to_string()));
    }

    tracing::info!(
        "Admin {} created user {} ({})",
        admin.identity.id,
        identity.id,
        username
    );
    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse {
            message: "User created successfully".into(),
            user_id: identity.id,
        }),
    ))
}

// 资料由存储端级联删除，这里不做校验
#[axum::debug_handler]
pub async fn delete_user(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .platform
        .identity
        .admin_delete_user(&id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to delete user {}: {}", id, e);
            ApiError::Upstream(e.to_string())
        })?;

    tracing::info!("Admin {} deleted user {}", admin.identity.id, id);
    Ok((
        StatusCode::OK,
        Json(MessageResponse {
            message: "User deleted successfully".into(),
        }),
    ))
}
