//! Shared-secret check for the internal API.
//!
//! Requests under `/api/` must carry `X-Internal-Secret` matching the
//! configured secret. With no secret configured the check is disabled
//! (dev only).

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};

pub async fn internal_secret_middleware(
    secret: Option<String>,
    request: Request,
    next: Next,
) -> Response {
    if !request.uri().path().starts_with("/api/") {
        return next.run(request).await;
    }

    let Some(secret) = secret else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get("x-internal-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided != secret {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    next.run(request).await
}
