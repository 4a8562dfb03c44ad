// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Request, StatusCode},
};
use cloudfn::{Engine, config::Config, http};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

pub const DEV_TOKEN: &str = "test-dev-token";

pub fn config() -> Config {
    let mut config = Config::default();
    config.runtime.workers = 1;
    config.auth.dev_token = Some(DEV_TOKEN.to_string());
    config
}

pub fn app(config: Config) -> Router {
    let engine = Engine::new(config).expect("engine should start");
    http::router(Arc::new(engine))
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> TestResponse {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    TestResponse {
        status,
        headers,
        body,
    }
}

/// Request authenticated through the developer bypass as `user`.
pub fn as_user(user: &str, method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-dev-token", DEV_TOKEN)
        .header("x-dev-user", user);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn anonymous(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

/// Creates and publishes a function, returning its id.
pub async fn deploy(app: &Router, user: &str, name: &str, code: &str) -> String {
    let created = send(
        app,
        as_user(
            user,
            "POST",
            "/functions",
            Some(serde_json::json!({ "name": name, "code": code })),
        ),
    )
    .await;
    assert_eq!(created.status, StatusCode::CREATED, "{}", created.text());
    let id = created.json()["data"]["id"].as_str().unwrap().to_string();

    let published = send(
        app,
        as_user(user, "POST", &format!("/functions/{id}/publish"), None),
    )
    .await;
    assert_eq!(published.status, StatusCode::OK, "{}", published.text());
    id
}
