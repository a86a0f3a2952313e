use axum::{
    Json, Router,
    body::Body,
    http::{HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;

const ALLOWED_HEADERS: &str = "Origin, X-Requested-With, Content-Type, Accept, Authorization";
const ALLOWED_METHODS: &str = "GET, POST, PUT, DELETE";

/// 所有 OPTIONS 请求直接返回 200 `{}`，不进入路由和鉴权
pub async fn preflight(req: Request<Body>, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return (StatusCode::OK, Json(json!({}))).into_response();
    }
    next.run(req).await
}

// 每个响应都带宽松的 CORS 头，包括 preflight 和错误响应
pub fn cors_headers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOWED_HEADERS),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        ))
}
