use std::sync::Arc;

use assist_harness::capture::{UnavailableAudioCapture, UnavailableScreenCapture};
use assist_harness::config::Config;
use assist_harness::llm::OpenAiAnswerClient;
use assist_harness::retrieval::DisabledProvider;
use assist_harness::server::{router, AppState, Backends};
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;

fn state(token: Option<&str>) -> AppState {
    let mut config = Config::minimal();
    config.server.token = token.map(str::to_string);
    config.llm.api_key_env = "ASSIST_HARNESS_TEST_UNSET_KEY".into();

    AppState::new(
        &config,
        Backends {
            retrieval: Arc::new(DisabledProvider::new()),
            answers: Arc::new(OpenAiAnswerClient::new(&config.llm).unwrap()),
            audio: Arc::new(UnavailableAudioCapture),
            screen: Arc::new(UnavailableScreenCapture),
        },
    )
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let response = router(state(None)).oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_frame_empty_then_published() {
    let state = state(None);

    let response = router(state.clone()).oneshot(get("/frame")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");

    state.frames.publish(b"\x89PNG frame".to_vec()).await;

    let response = router(state).oneshot(get("/frame")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    assert_eq!(response.headers()["x-frame-id"], "1");

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"\x89PNG frame");
}

#[tokio::test]
async fn test_frame_requires_token() {
    let app = router(state(Some("s3cret")));

    let response = app.clone().oneshot(get("/frame")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "unauthorized");

    let response = app
        .clone()
        .oneshot(get("/frame?token=wrong"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(get("/frame?token=s3cret"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let request = Request::builder()
        .uri("/frame")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_health_is_open_with_token() {
    let response = router(state(Some("s3cret")))
        .oneshot(get("/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
