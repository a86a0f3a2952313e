use axum::{
    Router,
    routing::{delete, get},
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::AppState;
use crate::error::ApiError;
use crate::middleware::{catch_panic, cors_headers, log_errors, preflight, require_admin};

pub mod health;
pub mod user;

async fn not_found() -> ApiError {
    ApiError::NotFound
}

pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    // 管理员接口
    let admin_routes = Router::new()
        .route(
            "/api/users",
            get(user::handler::list_users).post(user::handler::create_user),
        )
        .route("/api/users/{id}", delete(user::handler::delete_user))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_admin,
        ));

    let router = Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(catch_panic))
        .layer(axum::middleware::from_fn(log_errors))
        .layer(axum::middleware::from_fn(preflight));

    cors_headers(router)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
