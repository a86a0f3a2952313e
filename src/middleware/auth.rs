use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
    typed_header::TypedHeaderRejection,
};

use crate::AppState;
use crate::error::ApiError;
use crate::platform::{Identity, Profile, Role};

/// 通过管理员校验后写入请求扩展
#[derive(Debug, Clone)]
pub struct AdminContext {
    pub identity: Identity,
    pub profile: Profile,
}

// 校验顺序：请求头 -> 身份网关 -> 资料角色
pub async fn require_admin(
    State(state): State<AppState>,
    authorization: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let TypedHeader(Authorization(bearer)) = authorization.map_err(|rejection| {
        if rejection.is_missing() {
            ApiError::AuthMissing
        } else {
            ApiError::AuthMalformed
        }
    })?;

    let token = bearer.token().trim();
    if token.is_empty() {
        return Err(ApiError::AuthMalformed);
    }

    let identity = state
        .platform
        .identity
        .get_user(token)
        .await
        .map_err(|e| {
            tracing::debug!("Token rejected by identity gateway: {}", e);
            ApiError::AuthInvalid
        })?;

    let profile = match state.platform.profiles.get_profile(&identity.id).await {
        Ok(Some(profile)) if profile.role == Role::Admin => profile,
        Ok(_) => {
            tracing::warn!("Non-admin identity {} called the admin api", identity.id);
            return Err(ApiError::Forbidden);
        }
        Err(e) => {
            tracing::error!("Failed to load profile for {}: {}", identity.id, e);
            return Err(ApiError::Internal("Error fetching user profile".into()));
        }
    };

    req.extensions_mut().insert(AdminContext { identity, profile });
    Ok(next.run(req).await)
}
