// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::{collections::HashMap, sync::Arc};

use axum::{
    Json,
    body::Body,
    extract::{Extension, Query, Request},
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};

use super::{DomainOwner, auth, execution_headers, header_map, parse_body, rate_limit};
use crate::{
    engine::Engine,
    error::{RuntimeError, RuntimeResult},
    function::Function,
    monitor::{AuditRequest, sanitize_headers},
    protocol::PublicFailure,
    runtime::RequestContext,
    store::TriggerKind,
};

const MAX_PUBLIC_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Published function at `path`, by path first and by name only for
/// single-segment paths.
async fn resolve_published(
    engine: &Engine,
    path: &str,
    owner_id: Option<&str>,
) -> Option<Function> {
    if path.is_empty() {
        return None;
    }
    if let Some(function) = engine.store.find_published_by_path(path, owner_id).await {
        return Some(function);
    }
    if path.contains('/') {
        return None;
    }
    engine.store.find_published_by_name(path, owner_id).await
}

/// Functions with token auth only accept an `sk-` token of their owner.
async fn check_function_token(
    engine: &Engine,
    headers: &HeaderMap,
    function: &Function,
) -> RuntimeResult<()> {
    match auth::credential(headers) {
        Some(auth::Credential::ApiToken(token)) => {
            let record = auth::verify_api_token(engine, token).await?;
            if record.owner_id == function.owner_id {
                Ok(())
            } else {
                Err(RuntimeError::InvalidToken)
            }
        }
        Some(auth::Credential::Bearer(_)) => Err(RuntimeError::InvalidToken),
        None => Err(RuntimeError::TokenRequired),
    }
}

/// Fallback for every path no other route claimed: runs a published
/// function, or hands the request to the SPA when none matches. Only
/// requests that reach a function count against the rate limit.
pub async fn invoke_public(
    Extension(engine): Extension<Arc<Engine>>,
    domain: Option<Extension<DomainOwner>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().trim_matches('/').to_string();
    let owner_id = domain.as_ref().map(|Extension(domain)| domain.owner_id.as_str());

    let Some(function) = resolve_published(&engine, &path, owner_id).await else {
        return spa_fallback(&engine, parts).await;
    };
    if function.compiled.is_none() {
        return spa_fallback(&engine, parts).await;
    }

    let decision = match rate_limit::admit(&engine, &parts.headers, &parts.extensions) {
        Ok(decision) => decision,
        Err(limited) => return limited,
    };
    let trigger = match domain {
        Some(_) => TriggerKind::CustomDomain,
        None => TriggerKind::Public,
    };
    let mut response = run_public(&engine, function, trigger, parts, body).await;
    if let Some(decision) = decision {
        rate_limit::apply_headers(response.headers_mut(), &decision);
    }
    response
}

async fn run_public(
    engine: &Engine,
    function: Function,
    trigger: TriggerKind,
    parts: Parts,
    body: Body,
) -> Response {
    if function.require_token {
        if let Err(err) = check_function_token(engine, &parts.headers, &function).await {
            return err.into_response();
        }
    }

    let body = match axum::body::to_bytes(body, MAX_PUBLIC_BODY_BYTES).await {
        Ok(bytes) => parse_body(&bytes),
        Err(err) => {
            return RuntimeError::InvalidInput(format!("failed to read request body: {err}"))
                .into_response();
        }
    };
    let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .map(|Query(query)| query)
        .unwrap_or_default();

    let audit = AuditRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: query.clone(),
        headers: sanitize_headers(&parts.headers),
        body: body.clone(),
    };
    let request = RequestContext {
        body,
        query,
        headers: header_map(&parts.headers),
        user_id: Some(function.owner_id.clone()),
    };

    let result = match engine.execute(&function, request).await {
        Ok(result) => result,
        Err(err) => return err.into_response(),
    };
    engine.monitor.record(&function, trigger, audit, &result);

    let headers = execution_headers(&result, false);
    match result.error {
        None => (
            StatusCode::OK,
            headers,
            Json(result.data.unwrap_or_default()),
        )
            .into_response(),
        Some(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            headers,
            Json(PublicFailure::new(message)),
        )
            .into_response(),
    }
}

/// Serves the front-end from `server.spa_dir`: the file when it exists,
/// `index.html` otherwise.
async fn spa_fallback(engine: &Engine, parts: Parts) -> Response {
    let Some(dir) = engine.config.server.spa_dir.clone() else {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };
    let index = dir.join("index.html");
    let request = Request::from_parts(parts, Body::empty());
    match ServeDir::new(dir)
        .fallback(ServeFile::new(index))
        .oneshot(request)
        .await
    {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}
