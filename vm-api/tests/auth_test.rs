//! Integration tests for authentication middleware
//!
//! The middleware trusts the user headers set by the proxy in front of
//! vm-api and rejects requests that carry none.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware,
    routing::get,
    Router,
};
use serde_json::Value;
use tower::ServiceExt; // for `oneshot`
use vm_api::auth::{auth_middleware, AuthenticatedUser};

async fn whoami(axum::Extension(user): axum::Extension<AuthenticatedUser>) -> axum::Json<Value> {
    axum::Json(serde_json::json!({
        "username": user.username,
        "email": user.email,
    }))
}

fn create_test_app() -> Router {
    Router::new()
        .route("/whoami", get(whoami))
        .layer(middleware::from_fn(auth_middleware))
}

async fn call(headers: &[(&str, &[u8])]) -> (StatusCode, Option<Value>) {
    let mut builder = Request::builder().uri("/whoami");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Body::empty()).unwrap();

    let response = create_test_app().oneshot(request).await.unwrap();
    let status = response.status();
    if status != StatusCode::OK {
        return (status, None);
    }

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, Some(serde_json::from_slice(&body).unwrap()))
}

#[tokio::test]
async fn test_proxy_user_header_passes() {
    let (status, json) = call(&[("x-vm-user", b"alice")]).await;
    assert_eq!(status, StatusCode::OK);
    let json = json.unwrap();
    assert_eq!(json["username"], "alice");
    assert!(json["email"].is_null());
}

#[tokio::test]
async fn test_forwarded_user_header_passes() {
    let (status, json) = call(&[("x-forwarded-user", b"bob")]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.unwrap()["username"], "bob");
}

#[tokio::test]
async fn test_dev_fallback_header_passes() {
    let (status, json) = call(&[("x-user", b"carol")]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.unwrap()["username"], "carol");
}

#[tokio::test]
async fn test_header_priority() {
    let (_, json) = call(&[
        ("x-user", b"fallback"),
        ("x-forwarded-user", b"forwarded"),
        ("x-vm-user", b"proxied"),
    ])
    .await;
    assert_eq!(json.unwrap()["username"], "proxied");

    let (_, json) = call(&[("x-user", b"fallback"), ("x-forwarded-user", b"forwarded")]).await;
    assert_eq!(json.unwrap()["username"], "forwarded");
}

#[tokio::test]
async fn test_email_headers_are_extracted() {
    let (_, json) = call(&[("x-user", b"alice"), ("x-vm-email", b"alice@example.com")]).await;
    assert_eq!(json.unwrap()["email"], "alice@example.com");

    let (_, json) = call(&[
        ("x-user", b"alice"),
        ("x-forwarded-email", b"alice@corp.example.com"),
    ])
    .await;
    assert_eq!(json.unwrap()["email"], "alice@corp.example.com");
}

#[tokio::test]
async fn test_missing_user_header_returns_401() {
    let (status, _) = call(&[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // An email alone does not identify anyone.
    let (status, _) = call(&[("x-vm-email", b"alice@example.com")]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_empty_user_header_returns_401() {
    let (status, _) = call(&[("x-user", b"")]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_invalid_utf8_header_returns_401() {
    let (status, _) = call(&[("x-user", b"\xFF\xFE")]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_usernames_pass_through_unchanged() {
    for username in ["alice", "user-name_123", "first.last"] {
        let (status, json) = call(&[("x-user", username.as_bytes())]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.unwrap()["username"], username);
    }
}
