//! HTTP-level tests for the auth surface, driven through the router with
//! in-memory collaborators.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Extension, Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use presidio::auth::directory::{
    MemoryDirectory, MemorySmsSender, RecordingNotifier, StaticCaptchaVerifier, TableGeoLocator,
};
use presidio::auth::{
    AuthConfig, AuthService, ChallengeMethod, Collaborators, SecondFactorProfile, SystemClock,
};

struct Api {
    app: Router,
    directory: Arc<MemoryDirectory>,
    sms: Arc<MemorySmsSender>,
}

fn api() -> Api {
    let directory = Arc::new(MemoryDirectory::new());
    let sms = Arc::new(MemorySmsSender::new());
    let deps = Collaborators {
        credentials: directory.clone(),
        directory: directory.clone(),
        sms: sms.clone(),
        notifier: Arc::new(RecordingNotifier::new()),
        geo: Arc::new(TableGeoLocator::new()),
        captcha: Arc::new(StaticCaptchaVerifier::default()),
    };
    let service = Arc::new(AuthService::new(
        AuthConfig::new().without_failure_delay(),
        deps,
        Arc::new(SystemClock),
    ));

    let (router, _openapi) = presidio::api::router().split_for_parts();
    Api {
        app: router.layer(Extension(service)),
        directory,
        sms,
    }
}

async fn post_json(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds");
    let response = app.clone().oneshot(request).await.expect("handler runs");
    let status = response.status();
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_name_and_version() {
    let api = api();
    let response = api
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("handler runs");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("X-App"));

    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let value: Value = serde_json::from_slice(&bytes).expect("json body");
    assert_eq!(value["name"], "presidio");
    assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn login_with_wrong_secret_is_unauthorized_with_a_taxonomy_code() {
    let api = api();
    api.directory
        .add_user("alice@example.com", "hunter2", SecondFactorProfile::default());

    let (status, body) = post_json(
        &api.app,
        "/v1/auth/login",
        json!({ "identifier": "alice@example.com", "secret": "wrong" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "INVALID_CREDENTIALS");
}

#[tokio::test]
async fn login_without_second_factor_returns_the_user_id() {
    let api = api();
    let user_id = api
        .directory
        .add_user("alice@example.com", "hunter2", SecondFactorProfile::default());

    let (status, body) = post_json(
        &api.app,
        "/v1/auth/login",
        json!({ "identifier": "alice@example.com", "secret": "hunter2" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_id"], user_id.to_string());
}

#[tokio::test]
async fn sms_login_round_trips_through_challenge_endpoints() {
    let api = api();
    api.directory.add_user(
        "alice@example.com",
        "hunter2",
        SecondFactorProfile {
            methods: vec![ChallengeMethod::Sms],
            phone_number: Some("+15551234567".to_string()),
            masked_phone: Some("+1•••••4567".to_string()),
            ..SecondFactorProfile::default()
        },
    );

    let (status, body) = post_json(
        &api.app,
        "/v1/auth/login",
        json!({ "identifier": "alice@example.com", "secret": "hunter2" }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["method"], "SMS");
    assert_eq!(body["masked_phone"], "+1•••••4567");
    let token = body["challenge_token"].as_str().expect("token").to_string();

    let (status, body) = post_json(
        &api.app,
        "/v1/auth/challenge/status",
        json!({ "challenge_token": token }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["attempts_remaining"], 5);

    let code = api.sms.last_code().expect("code dispatched");
    let (status, body) = post_json(
        &api.app,
        "/v1/auth/challenge/verify",
        json!({ "challenge_token": token, "code": code }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["backup_code_consumed"], false);

    // The challenge is terminal; a replay answers 401 with the taxonomy code.
    let (status, body) = post_json(
        &api.app,
        "/v1/auth/challenge/verify",
        json!({ "challenge_token": token, "code": code }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "CHALLENGE_INVALID");
}

#[tokio::test]
async fn wrong_code_reports_remaining_attempts() {
    let api = api();
    api.directory.add_user(
        "alice@example.com",
        "hunter2",
        SecondFactorProfile {
            methods: vec![ChallengeMethod::Sms],
            phone_number: Some("+15551234567".to_string()),
            ..SecondFactorProfile::default()
        },
    );

    let (_status, body) = post_json(
        &api.app,
        "/v1/auth/login",
        json!({ "identifier": "alice@example.com", "secret": "hunter2" }),
    )
    .await;
    let token = body["challenge_token"].as_str().expect("token").to_string();

    let (status, body) = post_json(
        &api.app,
        "/v1/auth/challenge/verify",
        json!({ "challenge_token": token, "code": "wrong-code" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "CODE_MISMATCH");
    assert_eq!(body["attempts_remaining"], 4);
}

#[tokio::test]
async fn resend_answers_with_remaining_quota() {
    let api = api();
    api.directory.add_user(
        "alice@example.com",
        "hunter2",
        SecondFactorProfile {
            methods: vec![ChallengeMethod::Sms],
            phone_number: Some("+15551234567".to_string()),
            ..SecondFactorProfile::default()
        },
    );

    let (_status, body) = post_json(
        &api.app,
        "/v1/auth/login",
        json!({ "identifier": "alice@example.com", "secret": "hunter2" }),
    )
    .await;
    let token = body["challenge_token"].as_str().expect("token").to_string();

    let (status, body) = post_json(
        &api.app,
        "/v1/auth/challenge/resend",
        json!({ "challenge_token": token }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resends_remaining"], 2);
    assert_eq!(api.sms.sent().len(), 2);
}

#[tokio::test]
async fn unknown_challenge_token_is_unauthorized() {
    let api = api();
    let (status, body) = post_json(
        &api.app,
        "/v1/auth/challenge/verify",
        json!({ "challenge_token": "bogus", "code": "123456" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "CHALLENGE_INVALID");
}
