// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

mod account;
mod auth;
mod domains;
mod functions;
mod invoke;
mod public;
mod rate_limit;
mod versions;

pub use auth::{AuthMethod, AuthUser};
pub use domains::DomainOwner;

use std::{collections::HashMap, io::Write, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, delete, get, post},
};
use base64::Engine as _;
use flate2::{Compression, write::GzEncoder};
use serde::Serialize;
use serde_json::Value;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{Any as HTTP_Any, CorsLayer},
    timeout::TimeoutLayer,
};

use crate::{
    config::ServerConfig,
    engine::Engine,
    error::RuntimeError,
    protocol::Envelope,
    runtime::ExecutionResult,
};

pub const EXECUTION_TIME_HEADER: &str = "x-execution-time";
pub const FUNCTION_LOGS_HEADER: &str = "x-function-logs";

pub type ApiResult<T = Response> = Result<T, RuntimeError>;

/// The full application: management API, both invoke surfaces and the
/// custom-domain rewrite in front of them.
pub fn router(engine: Arc<Engine>) -> Router {
    let config = engine.config.server.clone();
    let routes = routes(engine.clone());

    // The domain rewrite has to run before routing, so the routes sit behind
    // an outer router's fallback.
    Router::new()
        .fallback_service(routes)
        .layer(middleware::from_fn_with_state(
            engine,
            domains::rewrite_custom_domain,
        ))
        .layer(build_cors_layer(&config))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            Duration::from_millis(config.default_timeout),
        ))
        .layer(ConcurrencyLimitLayer::new(config.concurrency_request_limit))
}

fn routes(engine: Arc<Engine>) -> Router {
    let rate_limited = middleware::from_fn_with_state(engine.clone(), rate_limit::enforce);

    let invoke = Router::new()
        .route("/invoke/{*path}", any(invoke::invoke_authenticated))
        .route_layer(rate_limited.clone());

    Router::new()
        .route("/health", get(health))
        .route("/compile", post(functions::compile_preview))
        .route(
            "/functions",
            get(functions::list_functions).post(functions::create_function),
        )
        .route(
            "/functions/{id}",
            get(functions::get_function)
                .put(functions::update_function)
                .delete(functions::delete_function),
        )
        .route("/functions/{id}/versions", get(versions::list_versions))
        .route("/functions/{id}/versions/diff", get(versions::diff_versions))
        .route("/functions/{id}/versions/{version}", get(versions::get_version))
        .route("/functions/{id}/publish", post(versions::publish))
        .route("/functions/{id}/rollback", post(versions::rollback))
        .route("/env", get(account::get_env).put(account::put_env))
        .route("/tokens", get(account::list_tokens).post(account::create_token))
        .route("/tokens/{id}", delete(account::delete_token))
        .route("/domains", get(domains::list_domains).post(domains::add_domain))
        .route("/domains/{domain}", delete(domains::delete_domain))
        .route("/domains/{domain}/verify", post(domains::verify_domain))
        .merge(invoke)
        .fallback(public::invoke_public)
        .layer(Extension(engine))
}

async fn health(Extension(engine): Extension<Arc<Engine>>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "workers": engine.executor.worker_count(),
    }))
}

fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    let Some(cors_config) = &config.cors else {
        return CorsLayer::permissive();
    };

    let mut cors = CorsLayer::new();
    if cors_config.allowed_origins.is_empty() {
        cors = cors.allow_origin(HTTP_Any);
    } else {
        let origins: Vec<HeaderValue> = cors_config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors = cors.allow_origin(origins);
    }

    if cors_config.allowed_methods.is_empty() {
        cors = cors.allow_methods(HTTP_Any);
    } else {
        let methods: Vec<Method> = cors_config
            .allowed_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        cors = cors.allow_methods(methods);
    }

    cors.allow_headers(HTTP_Any)
}

pub fn status_for(err: &RuntimeError) -> StatusCode {
    match err {
        RuntimeError::Compile(_) | RuntimeError::NotCompiled(_) | RuntimeError::InvalidInput(_) => {
            StatusCode::BAD_REQUEST
        }
        RuntimeError::FunctionNotFound(_) | RuntimeError::VersionNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        RuntimeError::TokenRequired | RuntimeError::InvalidToken | RuntimeError::Unauthorized(_) => {
            StatusCode::UNAUTHORIZED
        }
        RuntimeError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        RuntimeError::Conflict(_) => StatusCode::CONFLICT,
        RuntimeError::Load { .. }
        | RuntimeError::ExportShape(_)
        | RuntimeError::Execution(_)
        | RuntimeError::CallCycle { .. }
        | RuntimeError::Timeout(_)
        | RuntimeError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for RuntimeError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "Request rejected");
        }
        (status, Json(Envelope::failed(self.to_error_body()))).into_response()
    }
}

/// `200 {success: true, data}` with `data` serialised from `value`.
pub fn envelope<T: Serialize>(status: StatusCode, value: T) -> ApiResult {
    let data = serde_json::to_value(value).map_err(|e| RuntimeError::Storage(e.to_string()))?;
    Ok((status, Json(Envelope::ok(Some(data)))).into_response())
}

/// Request body as JSON when it parses, as a string otherwise, `null` when
/// empty.
pub fn parse_body(bytes: &[u8]) -> Value {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

pub fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
        .collect()
}

/// Gzip then base64 of the JSON log array.
pub fn encode_logs(logs: &[String]) -> Option<String> {
    let json = serde_json::to_vec(logs).ok()?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).ok()?;
    let compressed = encoder.finish().ok()?;
    Some(base64::engine::general_purpose::STANDARD.encode(compressed))
}

pub fn execution_headers(result: &ExecutionResult, include_logs: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(EXECUTION_TIME_HEADER, HeaderValue::from(result.duration_ms));
    if include_logs && !result.logs.is_empty() {
        match encode_logs(&result.logs).map(HeaderValue::try_from) {
            Some(Ok(value)) => {
                headers.insert(FUNCTION_LOGS_HEADER, value);
            }
            _ => tracing::warn!("Failed to encode function logs header"),
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    #[test]
    fn logs_header_round_trips_through_gzip() {
        let logs = vec!["hello".to_string(), "[WARN] careful".to_string()];
        let encoded = encode_logs(&logs).unwrap();

        let compressed = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        let mut json = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut json)
            .unwrap();
        assert_eq!(json, r#"["hello","[WARN] careful"]"#);
    }

    #[test]
    fn body_parsing_falls_back_to_text() {
        assert_eq!(parse_body(b""), Value::Null);
        assert_eq!(parse_body(br#"{"a":1}"#), serde_json::json!({"a": 1}));
        assert_eq!(parse_body(b"plain"), Value::String("plain".into()));
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            status_for(&RuntimeError::FunctionNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&RuntimeError::NotCompiled("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&RuntimeError::TokenRequired), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(&RuntimeError::Timeout(5)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
