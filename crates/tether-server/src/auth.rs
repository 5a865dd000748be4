//! Request guards: origin allow-list and bearer token extraction.
//!
//! Token validation itself happens per JSON-RPC request in the dispatcher's
//! middleware chain (see [`tether_rpc::AuthProvider`]); the HTTP layer only
//! hands the presented token over.

use axum::{
    body::Body,
    extract::State,
    http::{
        HeaderMap, Request,
        header::{AUTHORIZATION, ORIGIN},
    },
    middleware::Next,
    response::Response,
};

use crate::error::ServerError;
use crate::state::AppState;

/// Reject requests from origins that are not allowed.
///
/// Requests without an `Origin` header are not from a browser and pass.
pub async fn origin_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ServerError> {
    check_origin(request.headers(), &state.config().allowed_origins)?;
    Ok(next.run(request).await)
}

fn check_origin(headers: &HeaderMap, allowed: &[String]) -> Result<(), ServerError> {
    if allowed.is_empty() {
        return Ok(());
    }
    let Some(origin) = headers.get(ORIGIN) else {
        return Ok(());
    };

    let origin = origin
        .to_str()
        .map_err(|_| ServerError::Forbidden("invalid Origin header".to_string()))?;
    if allowed.iter().any(|o| o == origin) {
        Ok(())
    } else {
        Err(ServerError::Forbidden(format!("origin not allowed: {origin}")))
    }
}

/// The bearer token presented in `Authorization`, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}
