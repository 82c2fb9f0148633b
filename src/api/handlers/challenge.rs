//! Challenge endpoints: verification, method switching, SMS resend, and
//! status.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::login::ChallengeResponse;
use super::{client_context, error_response};
use crate::auth::{AuthService, ChallengeMethod, ErrorBody};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct VerifyRequest {
    pub challenge_token: String,
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct VerifyResponse {
    pub user_id: String,
    pub backup_code_consumed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_codes_remaining: Option<u32>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SwitchRequest {
    pub challenge_token: String,
    pub method: ChallengeMethod,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ChallengeTokenRequest {
    pub challenge_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ResendResponse {
    pub resends_remaining: u64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ChallengeStatusResponse {
    pub method: ChallengeMethod,
    pub expires_at_ms: i64,
    pub attempts_remaining: u32,
}

#[utoipa::path(
    post,
    path = "/v1/auth/challenge/verify",
    request_body = VerifyRequest,
    responses(
        (status = 200, description = "Second factor verified; finalize the session", body = VerifyResponse),
        (status = 401, description = "Wrong code or dead challenge", body = ErrorBody),
        (status = 409, description = "Code already used", body = ErrorBody),
        (status = 410, description = "Challenge expired or exhausted", body = ErrorBody),
        (status = 423, description = "Account locked", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "challenge"
)]
pub async fn verify(
    headers: HeaderMap,
    service: Extension<Arc<AuthService>>,
    payload: Option<Json<VerifyRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };

    let ctx = client_context(&headers, None);
    match service
        .verify_challenge(&request.challenge_token, &request.code, &ctx)
        .await
    {
        Ok(verified) => (
            StatusCode::OK,
            Json(VerifyResponse {
                user_id: verified.user_id.to_string(),
                backup_code_consumed: verified.backup_code_consumed,
                backup_codes_remaining: verified.backup_codes_remaining,
            }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/challenge/switch",
    request_body = SwitchRequest,
    responses(
        (status = 202, description = "Fresh challenge on the new method", body = ChallengeResponse),
        (status = 400, description = "Method not available", body = ErrorBody),
        (status = 401, description = "Dead challenge or same method", body = ErrorBody),
        (status = 410, description = "Challenge expired or switch budget spent", body = ErrorBody)
    ),
    tag = "challenge"
)]
pub async fn switch(
    service: Extension<Arc<AuthService>>,
    payload: Option<Json<SwitchRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };

    match service
        .switch_method(&request.challenge_token, request.method)
        .await
    {
        Ok(pending) => (
            StatusCode::ACCEPTED,
            Json(ChallengeResponse::from(pending)),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/challenge/resend",
    request_body = ChallengeTokenRequest,
    responses(
        (status = 200, description = "Replacement code dispatched", body = ResendResponse),
        (status = 401, description = "Dead or non-SMS challenge", body = ErrorBody),
        (status = 429, description = "Resend quota spent", body = ErrorBody),
        (status = 503, description = "SMS dispatch unavailable", body = ErrorBody)
    ),
    tag = "challenge"
)]
pub async fn resend(
    service: Extension<Arc<AuthService>>,
    payload: Option<Json<ChallengeTokenRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };

    match service.resend_code(&request.challenge_token).await {
        Ok(receipt) => (
            StatusCode::OK,
            Json(ResendResponse {
                resends_remaining: receipt.resends_remaining,
            }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/challenge/status",
    request_body = ChallengeTokenRequest,
    responses(
        (status = 200, description = "Pending challenge state", body = ChallengeStatusResponse),
        (status = 401, description = "Dead challenge", body = ErrorBody),
        (status = 410, description = "Challenge expired", body = ErrorBody)
    ),
    tag = "challenge"
)]
pub async fn status(
    service: Extension<Arc<AuthService>>,
    payload: Option<Json<ChallengeTokenRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };

    match service.challenge_status(&request.challenge_token) {
        Ok(view) => (
            StatusCode::OK,
            Json(ChallengeStatusResponse {
                method: view.method,
                expires_at_ms: view.expires_at_ms,
                attempts_remaining: view.attempts_remaining,
            }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}
