//! Login endpoint: password check behind the risk gate, then either a
//! completed-auth signal or a second-factor challenge.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::{client_context, error_response};
use crate::auth::{AuthService, ChallengeMethod, ErrorBody, LoginOutcome, PendingChallenge};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    pub identifier: String,
    pub secret: String,
    #[serde(default)]
    pub captcha_token: Option<String>,
    #[serde(default)]
    pub device_fingerprint: Option<String>,
}

/// Completed authentication; session issuance happens upstream.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionReadyResponse {
    pub user_id: String,
}

/// A pending second-factor challenge.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ChallengeResponse {
    pub challenge_token: String,
    pub method: ChallengeMethod,
    pub expires_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masked_phone: Option<String>,
}

impl From<PendingChallenge> for ChallengeResponse {
    fn from(pending: PendingChallenge) -> Self {
        Self {
            challenge_token: pending.token,
            method: pending.method,
            expires_at_ms: pending.expires_at_ms,
            masked_phone: pending.masked_phone,
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated; finalize the session", body = SessionReadyResponse),
        (status = 202, description = "Second factor required", body = ChallengeResponse),
        (status = 401, description = "Invalid credentials", body = ErrorBody),
        (status = 403, description = "CAPTCHA required or failed", body = ErrorBody),
        (status = 423, description = "Account locked", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    service: Extension<Arc<AuthService>>,
    payload: Option<Json<LoginRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };

    let ctx = client_context(&headers, request.device_fingerprint.clone());
    match service
        .login(
            &request.identifier,
            &request.secret,
            request.captcha_token.as_deref(),
            &ctx,
        )
        .await
    {
        Ok(LoginOutcome::Completed(completed)) => (
            StatusCode::OK,
            Json(SessionReadyResponse {
                user_id: completed.user_id.to_string(),
            }),
        )
            .into_response(),
        Ok(LoginOutcome::ChallengeIssued(pending)) => (
            StatusCode::ACCEPTED,
            Json(ChallengeResponse::from(pending)),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}
