// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::{collections::HashMap, sync::Arc};

use axum::{
    Json,
    body::Bytes,
    extract::{Extension, Path, Query},
    http::{HeaderMap, Method, StatusCode},
    response::IntoResponse,
};

use super::{ApiResult, AuthUser, execution_headers, header_map, parse_body};
use crate::{
    engine::Engine,
    error::RuntimeError,
    function::Function,
    monitor::{AuditRequest, sanitize_headers},
    protocol::{Envelope, ErrorBody},
    runtime::RequestContext,
    store::TriggerKind,
};

/// Owner-scoped lookup by path, falling back to name for legacy records.
async fn resolve_owned(engine: &Engine, owner_id: &str, path: &str) -> Option<Function> {
    match engine.store.find_by_path(owner_id, path).await {
        Some(function) => Some(function),
        None => engine.store.find_by_name(owner_id, path).await,
    }
}

/// `ANY /invoke/{*path}`
pub async fn invoke_authenticated(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Path(path): Path<String>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let path = path.trim_matches('/').to_string();
    let function = resolve_owned(&engine, &user.user_id, &path)
        .await
        .ok_or_else(|| RuntimeError::FunctionNotFound(path.clone()))?;
    if function.compiled.is_none() {
        return Err(RuntimeError::NotCompiled(function.name.clone()));
    }

    let body = parse_body(&body);
    let audit = AuditRequest {
        method: method.to_string(),
        path: format!("/invoke/{path}"),
        query: query.clone(),
        headers: sanitize_headers(&headers),
        body: body.clone(),
    };
    let request = RequestContext {
        body,
        query,
        headers: header_map(&headers),
        user_id: Some(user.user_id.clone()),
    };

    let result = engine.execute(&function, request).await?;
    engine
        .monitor
        .record(&function, TriggerKind::Invoke, audit, &result);

    tracing::debug!(
        function = %function.path,
        duration_ms = result.duration_ms,
        success = result.is_success(),
        "Invoked function"
    );

    let headers = execution_headers(&result, true);
    Ok(match result.error {
        None => (StatusCode::OK, headers, Json(Envelope::ok(result.data))).into_response(),
        Some(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            headers,
            Json(Envelope::failed(ErrorBody::new("EXECUTION_ERROR", message))),
        )
            .into_response(),
    })
}
