// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

mod common;

use std::io::Read;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use base64::Engine as _;
use flate2::read::GzDecoder;
use serde_json::{Value, json};

use common::{anonymous, app, as_user, config, deploy, send};

const HELLO: &str = r#"
interface Ctx { body: unknown }
export default async function handler(ctx: Ctx): Promise<string> {
  console.log("saying hello");
  return "world";
}
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn authenticated_invoke_wraps_the_result() {
    let app = app(config());
    deploy(&app, "alice", "hello", HELLO).await;

    let response = send(&app, as_user("alice", "GET", "/invoke/hello", None)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json(), json!({ "success": true, "data": "world" }));
    assert!(response.headers.contains_key("x-execution-time"));

    let encoded = response.headers["x-function-logs"].to_str().unwrap();
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .unwrap();
    let mut logs = String::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_string(&mut logs)
        .unwrap();
    assert_eq!(logs, r#"["saying hello"]"#);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn authenticated_invoke_is_scoped_to_the_caller() {
    let app = app(config());
    deploy(&app, "alice", "hello", HELLO).await;

    let response = send(&app, as_user("bob", "GET", "/invoke/hello", None)).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.json()["error"]["code"], "FUNCTION_NOT_FOUND");

    let response = send(&app, anonymous("GET", "/invoke/hello")).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_context_reaches_the_function() {
    let app = app(config());
    deploy(
        &app,
        "alice",
        "echo",
        "export default (ctx: any) => ({ body: ctx.body, q: ctx.query.q, user: ctx.userId });",
    )
    .await;

    let request = Request::builder()
        .method("POST")
        .uri("/invoke/echo?q=1")
        .header("x-dev-token", common::DEV_TOKEN)
        .header("x-dev-user", "alice")
        .body(Body::from(r#"{"name":"x"}"#))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(
        response.json()["data"],
        json!({ "body": { "name": "x" }, "q": "1", "user": "alice" })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thrown_errors_become_execution_errors() {
    let app = app(config());
    deploy(
        &app,
        "alice",
        "boom",
        "export default () => { throw new Error('boom'); };",
    )
    .await;

    let response = send(&app, as_user("alice", "GET", "/invoke/boom", None)).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.json(),
        json!({ "success": false, "error": { "code": "EXECUTION_ERROR", "message": "boom" } })
    );

    let response = send(&app, anonymous("GET", "/boom")).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.json(),
        json!({ "success": false, "error": { "message": "boom" } })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn public_invoke_returns_raw_data() {
    let app = app(config());
    deploy(&app, "alice", "hello", HELLO).await;

    let response = send(&app, anonymous("GET", "/hello")).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json(), Value::String("world".into()));
    assert!(response.headers.contains_key("x-execution-time"));
    assert!(!response.headers.contains_key("x-function-logs"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nested_paths_and_sibling_calls() {
    let app = app(config());
    let created = send(
        &app,
        as_user(
            "alice",
            "POST",
            "/functions",
            Some(json!({
                "name": "users",
                "path": "api/users",
                "code": "export default (ctx: any) => ({ id: ctx.body.id, greeting: ctx.cloud.env.GREETING });"
            })),
        ),
    )
    .await;
    let id = created.json()["data"]["id"].as_str().unwrap().to_string();
    send(
        &app,
        as_user("alice", "POST", &format!("/functions/{id}/publish"), None),
    )
    .await;
    deploy(
        &app,
        "alice",
        "profile",
        "export default async (ctx: any) => ctx.cloud.invoke('users', { id: 7 });",
    )
    .await;
    send(
        &app,
        as_user("alice", "PUT", "/env", Some(json!({ "GREETING": "hi" }))),
    )
    .await;

    let direct = Request::builder()
        .method("POST")
        .uri("/api/users")
        .body(Body::from(r#"{"id":1}"#))
        .unwrap();
    let response = send(&app, direct).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json(), json!({ "id": 1, "greeting": "hi" }));

    let response = send(&app, anonymous("GET", "/profile")).await;
    assert_eq!(response.json(), json!({ "id": 7, "greeting": "hi" }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unpublished_functions_fall_through_to_the_spa() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<html>ide</html>").unwrap();
    let mut config = config();
    config.server.spa_dir = Some(dir.path().to_path_buf());
    let app = app(config);

    send(
        &app,
        as_user(
            "alice",
            "POST",
            "/functions",
            Some(json!({ "name": "draft", "code": "export default () => 1;" })),
        ),
    )
    .await;

    let response = send(&app, anonymous("GET", "/draft")).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text(), "<html>ide</html>");

    let response = send(&app, as_user("alice", "GET", "/invoke/draft", None)).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"]["code"], "NOT_COMPILED");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_paths_without_a_spa_are_not_found() {
    let app = app(config());
    let response = send(&app, anonymous("GET", "/nothing/here")).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_protected_functions() {
    let app = app(config());
    let created = send(
        &app,
        as_user(
            "alice",
            "POST",
            "/functions",
            Some(json!({ "name": "secret", "code": "export default () => 'ok';", "requireToken": true })),
        ),
    )
    .await;
    let id = created.json()["data"]["id"].as_str().unwrap().to_string();
    send(
        &app,
        as_user("alice", "POST", &format!("/functions/{id}/publish"), None),
    )
    .await;

    let response = send(&app, anonymous("GET", "/secret")).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.json()["error"]["code"], "TOKEN_REQUIRED");

    let invalid = Request::builder()
        .uri("/secret")
        .header("authorization", "sk-not-a-real-token")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, invalid).await;
    assert_eq!(response.json()["error"]["code"], "INVALID_TOKEN");

    let token = send(
        &app,
        as_user("alice", "POST", "/tokens", Some(json!({ "name": "ci" }))),
    )
    .await;
    let token = token.json()["data"]["token"].as_str().unwrap().to_string();
    let authorized = Request::builder()
        .uri("/secret")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let response = send(&app, authorized).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json(), json!("ok"));

    // Tokens of another owner do not unlock the function.
    let other = send(&app, as_user("bob", "POST", "/tokens", Some(json!({})))).await;
    let other = other.json()["data"]["token"].as_str().unwrap().to_string();
    let foreign = Request::builder()
        .uri("/secret")
        .header("authorization", other)
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, foreign).await.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_domains_route_to_their_target() {
    let app = app(config());
    deploy(&app, "alice", "hello", HELLO).await;

    let added = send(
        &app,
        as_user(
            "alice",
            "POST",
            "/domains",
            Some(json!({ "domain": "fn.example.com", "targetPath": "hello" })),
        ),
    )
    .await;
    assert_eq!(added.status, StatusCode::CREATED);
    assert_eq!(added.json()["data"]["verified"], false);

    let on_domain = || {
        Request::builder()
            .uri("/anything?x=1")
            .header("host", "fn.example.com:443")
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(send(&app, on_domain()).await.status, StatusCode::NOT_FOUND);

    let verified = send(
        &app,
        as_user("alice", "POST", "/domains/fn.example.com/verify", None),
    )
    .await;
    assert_eq!(verified.json()["data"]["verified"], true);

    let response = send(&app, on_domain()).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json(), json!("world"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limited_clients_get_429() {
    let mut config = config();
    config.rate_limit.burst = 1;
    config.rate_limit.requests_per_second = 1;
    let app = app(config);
    deploy(&app, "alice", "hello", HELLO).await;

    let request = |uri: &str| {
        Request::builder()
            .uri(uri)
            .header("x-forwarded-for", "10.1.2.3")
            .body(Body::empty())
            .unwrap()
    };
    let first = send(&app, request("/hello")).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.headers["x-ratelimit-limit"], "1");

    let second = send(&app, request("/hello")).await;
    assert_eq!(second.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second.json()["error"]["code"], "RATE_LIMIT_EXCEEDED");
    assert!(second.headers.contains_key("retry-after"));

    // Paths that name no function fall through without spending the budget.
    let missing = send(&app, request("/assets/app.js")).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert!(!missing.headers.contains_key("x-ratelimit-limit"));

    // Management routes are not rate limited.
    let health = send(&app, anonymous("GET", "/health")).await;
    assert_eq!(health.status, StatusCode::OK);
}
