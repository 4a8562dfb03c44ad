// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Extension, Path, Query},
    http::StatusCode,
};
use serde::Deserialize;

use super::{ApiResult, AuthUser, envelope};
use crate::{engine::Engine, error::RuntimeError};

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    pub from: u32,
    pub to: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct PublishRequest {
    #[serde(default)]
    pub changelog: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub version: u32,
}

pub async fn list_versions(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult {
    let function = engine.functions.get_owned(&user.user_id, &id).await?;
    envelope(StatusCode::OK, engine.versions.versions(&function.id).await)
}

pub async fn get_version(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Path((id, version)): Path<(String, u32)>,
) -> ApiResult {
    let function = engine.functions.get_owned(&user.user_id, &id).await?;
    envelope(StatusCode::OK, engine.versions.version(&function.id, version).await?)
}

/// `GET /functions/{id}/versions/diff?from=1&to=2`
pub async fn diff_versions(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Path(id): Path<String>,
    Query(query): Query<DiffQuery>,
) -> ApiResult {
    let function = engine.functions.get_owned(&user.user_id, &id).await?;
    let diff = engine.versions.diff(&function.id, query.from, query.to).await?;
    envelope(StatusCode::OK, diff)
}

/// The body is optional, so it is read raw instead of through `Json`.
pub async fn publish(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult {
    let request: PublishRequest = if body.iter().all(u8::is_ascii_whitespace) {
        PublishRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| RuntimeError::InvalidInput(format!("invalid publish body: {e}")))?
    };
    let version = engine
        .functions
        .publish(&user.user_id, &id, request.changelog)
        .await?;
    envelope(StatusCode::OK, version)
}

pub async fn rollback(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> ApiResult {
    let version = engine
        .functions
        .rollback(&user.user_id, &id, request.version)
        .await?;
    envelope(StatusCode::OK, version)
}
