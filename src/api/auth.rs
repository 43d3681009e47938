// =============================================================================
// Admin bearer auth for the control-plane surface
// =============================================================================
//
// Most of the query API is read-only telemetry; only the operator actions
// (force-reconnect) and the downstream WS upgrade need gating. Both paths
// — the `Authorization` header on a normal request and the `token` query
// parameter on the WS upgrade — funnel through the same `authorize` check
// against a single shared secret in `ADMIN_TOKEN`, compared in constant
// time so a timing side-channel can't narrow down the secret.
// =============================================================================

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn expected_token() -> String {
    std::env::var("ADMIN_TOKEN").unwrap_or_default()
}

/// Single check shared by the header extractor and the WS query-param path.
fn authorize(token: Option<&str>) -> Result<(), &'static str> {
    let expected = expected_token();
    if expected.is_empty() {
        warn!("ADMIN_TOKEN is not set, rejecting all admin requests");
        return Err("server authentication not configured");
    }
    match token {
        Some(t) if constant_time_eq(t.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => {
            warn!("rejected admin request with missing or invalid token");
            Err("missing or invalid authorization token")
        }
    }
}

pub struct AuthBearer(pub String);

pub struct AuthRejection(&'static str);

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (StatusCode::FORBIDDEN, axum::Json(serde_json::json!({"error": self.0}))).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        authorize(token)
            .map(|_| AuthBearer(token.unwrap_or_default().to_string()))
            .map_err(AuthRejection)
    }
}

/// Validates a token carried as a query parameter, for the WS upgrade route
/// where there is no `Authorization` header to extract from.
pub fn validate_token(token: &str) -> bool {
    authorize(Some(token)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_identical_and_rejects_mismatches() {
        assert!(constant_time_eq(b"hunter2", b"hunter2"));
        assert!(!constant_time_eq(b"hunter2", b"hunter3"));
        assert!(!constant_time_eq(b"short", b"much longer"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn validate_token_rejects_everything_when_admin_token_is_unset() {
        std::env::remove_var("ADMIN_TOKEN");
        assert!(!validate_token("anything"));
        assert!(!validate_token(""));
    }

    #[test]
    fn validate_token_accepts_only_the_exact_configured_secret() {
        std::env::set_var("ADMIN_TOKEN", "s3cret-admin-token");
        assert!(validate_token("s3cret-admin-token"));
        assert!(!validate_token("s3cret-admin-toke"));
        assert!(!validate_token("wrong"));
        std::env::remove_var("ADMIN_TOKEN");
    }
}
