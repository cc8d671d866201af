//! API authentication: the `X-Ghost-Key` header is hashed and compared in
//! constant time against the startup-computed digest of the configured
//! key. No loop entry without it.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

pub async fn require_ghost_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let provided = req
        .headers()
        .get("x-ghost-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    // Fixed-length digests compared in constant time; neither key length
    // nor prefix leaks.
    let provided_hash = Sha256::digest(provided.as_bytes());
    if !bool::from(provided_hash.ct_eq(state.api_key_hash.as_slice())) {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "invalid or missing API key" })),
        )
            .into_response();
    }

    next.run(req).await
}
