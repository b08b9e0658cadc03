mod common;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use tokio::sync::watch;
use tower::ServiceExt;

use cloudpilot::auth::jwt::{Claims, encode_token};

fn bearer() -> String {
    let claims = Claims::new(
        uuid::Uuid::now_v7(),
        None,
        Vec::new(),
        chrono::Duration::minutes(5),
    );
    format!("Bearer {}", encode_token(&claims, common::SECRET).unwrap())
}

#[tokio::test]
async fn responses_carry_security_headers() {
    let (_shutdown, rx) = watch::channel(false);
    let (state, _) = common::test_state(rx);
    let app = cloudpilot::build_app(state);

    let resp = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let headers = resp.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["referrer-policy"], "no-referrer");
}

#[tokio::test]
async fn oversized_body_is_refused() {
    let (_shutdown, rx) = watch::channel(false);
    let (state, _) = common::test_state(rx);
    let limit = state.config.max_body_size;
    let app = cloudpilot::build_app(state);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/actions")
                .header(header::AUTHORIZATION, bearer())
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::CONTENT_LENGTH, limit + 1)
                .body(Body::from(vec![b' '; limit + 1]))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn cookie_token_is_accepted() {
    let (_shutdown, rx) = watch::channel(false);
    let (state, _) = common::test_state(rx);
    let app = cloudpilot::build_app(state);
    let token = bearer().trim_start_matches("Bearer ").to_string();

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/actions")
                .header(header::COOKIE, format!("access_token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let list: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(list, serde_json::json!([]));
}
