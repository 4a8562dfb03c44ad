// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{anonymous, app, as_user, config, deploy, send};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn management_requires_authentication() {
    let app = app(config());

    let response = send(&app, anonymous("GET", "/functions")).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.json(),
        json!({
            "success": false,
            "error": { "code": "UNAUTHORIZED", "message": "Missing authorization token" }
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn function_crud_is_owner_scoped() {
    let app = app(config());

    let created = send(
        &app,
        as_user(
            "alice",
            "POST",
            "/functions",
            Some(json!({ "name": "hello", "path": "/api/hello/", "code": "export default () => 1;" })),
        ),
    )
    .await;
    assert_eq!(created.status, StatusCode::CREATED);
    let data = created.json()["data"].clone();
    assert_eq!(data["path"], "api/hello");
    assert_eq!(data["published"], false);
    let id = data["id"].as_str().unwrap().to_string();

    let duplicate = send(
        &app,
        as_user(
            "alice",
            "POST",
            "/functions",
            Some(json!({ "name": "other", "path": "api/hello" })),
        ),
    )
    .await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);

    let foreign = send(&app, as_user("bob", "GET", &format!("/functions/{id}"), None)).await;
    assert_eq!(foreign.status, StatusCode::NOT_FOUND);
    let listed = send(&app, as_user("bob", "GET", "/functions", None)).await;
    assert_eq!(listed.json()["data"], json!([]));

    let updated = send(
        &app,
        as_user(
            "alice",
            "PUT",
            &format!("/functions/{id}"),
            Some(json!({ "requireToken": true })),
        ),
    )
    .await;
    assert_eq!(updated.json()["data"]["requireToken"], true);

    let deleted = send(&app, as_user("alice", "DELETE", &format!("/functions/{id}"), None)).await;
    assert_eq!(deleted.status, StatusCode::OK);
    let missing = send(&app, as_user("alice", "GET", &format!("/functions/{id}"), None)).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compile_preview_reports_errors_without_storing() {
    let app = app(config());

    let ok = send(
        &app,
        as_user(
            "alice",
            "POST",
            "/compile",
            Some(json!({ "code": "export default (x: number): number => x;" })),
        ),
    )
    .await;
    assert_eq!(ok.status, StatusCode::OK);
    assert_eq!(ok.json()["success"], true);
    assert!(ok.json()["compiled"].as_str().unwrap().contains("exports.default"));

    let failed = send(
        &app,
        as_user("alice", "POST", "/compile", Some(json!({ "code": "export default (" }))),
    )
    .await;
    assert_eq!(failed.status, StatusCode::OK);
    assert_eq!(failed.json()["success"], false);
    assert!(failed.json()["error"]["message"].is_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publishing_broken_code_is_rejected() {
    let app = app(config());
    let created = send(
        &app,
        as_user(
            "alice",
            "POST",
            "/functions",
            Some(json!({ "name": "broken", "code": "export default (" })),
        ),
    )
    .await;
    let id = created.json()["data"]["id"].as_str().unwrap().to_string();

    let response = send(
        &app,
        as_user("alice", "POST", &format!("/functions/{id}/publish"), None),
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"]["code"], "COMPILE_ERROR");

    let versions = send(
        &app,
        as_user("alice", "GET", &format!("/functions/{id}/versions"), None),
    )
    .await;
    assert_eq!(versions.json()["data"], json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn versions_publish_diff_and_rollback() {
    let app = app(config());
    let id = deploy(&app, "alice", "counter", "export default () => 1;").await;

    send(
        &app,
        as_user(
            "alice",
            "PUT",
            &format!("/functions/{id}"),
            Some(json!({ "code": "export default () => 2;" })),
        ),
    )
    .await;
    // Edits stay invisible until published.
    let live = send(&app, as_user("alice", "GET", "/invoke/counter", None)).await;
    assert_eq!(live.json()["data"], 1);

    let published = send(
        &app,
        as_user(
            "alice",
            "POST",
            &format!("/functions/{id}/publish"),
            Some(json!({ "changelog": "return two" })),
        ),
    )
    .await;
    assert_eq!(published.json()["data"]["version"], 2);
    assert_eq!(published.json()["data"]["changelog"], "return two");
    let live = send(&app, as_user("alice", "GET", "/invoke/counter", None)).await;
    assert_eq!(live.json()["data"], 2);

    let versions = send(
        &app,
        as_user("alice", "GET", &format!("/functions/{id}/versions"), None),
    )
    .await;
    let numbers: Vec<u64> = versions.json()["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["version"].as_u64().unwrap())
        .collect();
    assert_eq!(numbers, vec![2, 1]);

    let diff = send(
        &app,
        as_user(
            "alice",
            "GET",
            &format!("/functions/{id}/versions/diff?from=1&to=2"),
            None,
        ),
    )
    .await;
    assert_eq!(
        diff.json()["data"]["changes"],
        json!([
            { "op": "remove", "line": "export default () => 1;" },
            { "op": "add", "line": "export default () => 2;" }
        ])
    );

    let rolled_back = send(
        &app,
        as_user(
            "alice",
            "POST",
            &format!("/functions/{id}/rollback"),
            Some(json!({ "version": 1 })),
        ),
    )
    .await;
    assert_eq!(rolled_back.json()["data"]["version"], 3);
    assert_eq!(rolled_back.json()["data"]["changelog"], "rolled back to v1");
    let live = send(&app, as_user("alice", "GET", "/invoke/counter", None)).await;
    assert_eq!(live.json()["data"], 1);

    let v1 = send(
        &app,
        as_user("alice", "GET", &format!("/functions/{id}/versions/1"), None),
    )
    .await;
    assert_eq!(v1.json()["data"]["code"], "export default () => 1;");

    let unknown = send(
        &app,
        as_user("alice", "GET", &format!("/functions/{id}/versions/9"), None),
    )
    .await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
    assert_eq!(unknown.json()["error"]["code"], "VERSION_NOT_FOUND");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn environment_and_tokens() {
    let app = app(config());

    let put = send(
        &app,
        as_user("alice", "PUT", "/env", Some(json!({ "API_KEY": "k" }))),
    )
    .await;
    assert_eq!(put.status, StatusCode::OK);
    let env = send(&app, as_user("alice", "GET", "/env", None)).await;
    assert_eq!(env.json()["data"], json!({ "API_KEY": "k" }));
    let other = send(&app, as_user("bob", "GET", "/env", None)).await;
    assert_eq!(other.json()["data"], json!({}));

    let invalid = send(&app, as_user("alice", "PUT", "/env", Some(json!({ "": "x" })))).await;
    assert_eq!(invalid.status, StatusCode::BAD_REQUEST);

    let created = send(
        &app,
        as_user("alice", "POST", "/tokens", Some(json!({ "name": "ci" }))),
    )
    .await;
    assert_eq!(created.status, StatusCode::CREATED);
    let data = created.json()["data"].clone();
    let token = data["token"].as_str().unwrap().to_string();
    assert!(token.starts_with("sk-"));
    assert!(data.get("tokenHash").is_none());

    // The token authenticates the management API as its owner.
    let request = axum::http::Request::builder()
        .uri("/functions")
        .header("authorization", &token)
        .body(axum::body::Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status, StatusCode::OK);

    let listed = send(&app, as_user("alice", "GET", "/tokens", None)).await;
    let tokens = listed.json()["data"].as_array().unwrap().clone();
    assert_eq!(tokens.len(), 1);
    assert!(tokens[0].get("token").is_none());
    let token_id = tokens[0]["id"].as_str().unwrap().to_string();

    let deleted = send(
        &app,
        as_user("alice", "DELETE", &format!("/tokens/{token_id}"), None),
    )
    .await;
    assert_eq!(deleted.status, StatusCode::OK);
    let request = axum::http::Request::builder()
        .uri("/functions")
        .header("authorization", &token)
        .body(axum::body::Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn domains_are_listed_per_owner() {
    let app = app(config());

    send(
        &app,
        as_user("alice", "POST", "/domains", Some(json!({ "domain": "A.Example.com" }))),
    )
    .await;
    let taken = send(
        &app,
        as_user("bob", "POST", "/domains", Some(json!({ "domain": "a.example.com" }))),
    )
    .await;
    assert_eq!(taken.status, StatusCode::CONFLICT);

    let listed = send(&app, as_user("alice", "GET", "/domains", None)).await;
    assert_eq!(listed.json()["data"][0]["domain"], "a.example.com");

    let foreign = send(
        &app,
        as_user("bob", "POST", "/domains/a.example.com/verify", None),
    )
    .await;
    assert_eq!(foreign.status, StatusCode::BAD_REQUEST);

    let deleted = send(
        &app,
        as_user("alice", "DELETE", "/domains/a.example.com", None),
    )
    .await;
    assert_eq!(deleted.status, StatusCode::OK);
    let listed = send(&app, as_user("alice", "GET", "/domains", None)).await;
    assert_eq!(listed.json()["data"], json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_reports_workers() {
    let mut config = config();
    config.runtime.workers = 2;
    let app = app(config);

    let response = send(&app, anonymous("GET", "/health")).await;
    assert_eq!(response.json(), json!({ "status": "ok", "workers": 2 }));
}
