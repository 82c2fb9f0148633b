//! API handlers and shared request utilities.

pub mod challenge;
pub mod health;
pub mod login;

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};

use crate::auth::{AuthError, ClientContext, ErrorBody};

/// Extract a client IP for risk and rate limiting from common proxy headers.
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Assemble the request-scoped client context the risk layers consume.
pub(crate) fn client_context(
    headers: &HeaderMap,
    device_fingerprint: Option<String>,
) -> ClientContext {
    ClientContext {
        ip: extract_client_ip(headers),
        user_agent: headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        device_fingerprint,
    }
}

/// Map a taxonomy member onto an HTTP response with a structured body.
pub(crate) fn error_response(err: &AuthError) -> Response {
    let status = match err {
        AuthError::InvalidCredentials { .. }
        | AuthError::ChallengeInvalid
        | AuthError::CodeMismatch { .. } => StatusCode::UNAUTHORIZED,
        AuthError::CaptchaRequired | AuthError::CaptchaFailed => StatusCode::FORBIDDEN,
        AuthError::AccountLocked { .. } => StatusCode::LOCKED,
        AuthError::ChallengeExpired | AuthError::ChallengeExhausted => StatusCode::GONE,
        AuthError::CodeAlreadyUsed => StatusCode::CONFLICT,
        AuthError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        AuthError::NoSecondFactor => StatusCode::BAD_REQUEST,
        AuthError::DownstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(ErrorBody::from(err))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extract_client_ip_prefers_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 5.6.7.8"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("1.2.3.4".to_string()));
    }

    #[test]
    fn extract_client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("9.9.9.9".to_string()));
    }

    #[test]
    fn client_context_picks_up_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::USER_AGENT,
            HeaderValue::from_static("curl/8.4.0"),
        );
        let ctx = client_context(&headers, Some("fp".to_string()));
        assert_eq!(ctx.user_agent.as_deref(), Some("curl/8.4.0"));
        assert_eq!(ctx.device_fingerprint.as_deref(), Some("fp"));
        assert!(ctx.ip.is_none());
    }

    #[test]
    fn error_statuses_follow_the_taxonomy() {
        let locked = error_response(&AuthError::AccountLocked {
            locked_until_ms: 42,
        });
        assert_eq!(locked.status(), StatusCode::LOCKED);

        let limited = error_response(&AuthError::RateLimited {
            retry_after_ms: None,
        });
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

        let mismatch = error_response(&AuthError::CodeMismatch {
            attempts_remaining: 1,
        });
        assert_eq!(mismatch.status(), StatusCode::UNAUTHORIZED);
    }
}
