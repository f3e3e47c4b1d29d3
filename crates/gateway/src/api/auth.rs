//! Bearer-token authentication middleware.
//!
//! The token is read once at startup and cached as a SHA-256 digest in
//! `AppState`. When a token is configured, every request (including
//! WebSocket upgrades, which carry the header) must present
//! `Authorization: Bearer <token>`; without one the daemon runs open
//! (loopback dev mode, warned once at boot).

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Hash a configured token for storage in `AppState`.
pub fn token_hash(token: &str) -> Vec<u8> {
    Sha256::digest(token.as_bytes()).to_vec()
}

/// Axum middleware enforcing the bearer token on protected routes.
pub async fn require_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let expected = match &state.api_token_hash {
        Some(hash) => hash,
        None => return next.run(req).await,
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    // Compare fixed-length digests in constant time so neither token
    // length nor prefix leaks.
    let provided_hash = Sha256::digest(provided.as_bytes());
    if !bool::from(provided_hash.ct_eq(expected.as_slice())) {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "invalid or missing token" })),
        )
            .into_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_token_sensitive() {
        assert_eq!(token_hash("secret"), token_hash("secret"));
        assert_ne!(token_hash("secret"), token_hash("Secret"));
        assert_eq!(token_hash("secret").len(), 32);
    }
}
