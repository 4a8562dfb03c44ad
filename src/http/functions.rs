// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use serde::Deserialize;

use super::{ApiResult, AuthUser, envelope};
use crate::{
    engine::Engine,
    function::{FunctionPatch, NewFunction},
    runtime::CompileOutcome,
};

#[derive(Debug, Deserialize)]
pub struct CompileRequest {
    pub code: String,
}

/// `POST /compile`: compiles without storing anything.
pub async fn compile_preview(
    Extension(engine): Extension<Arc<Engine>>,
    _user: AuthUser,
    Json(request): Json<CompileRequest>,
) -> Json<CompileOutcome> {
    Json(engine.functions.compiler().safe_compile(&request.code))
}

pub async fn list_functions(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
) -> ApiResult {
    envelope(StatusCode::OK, engine.functions.list(&user.user_id).await)
}

pub async fn create_function(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Json(request): Json<NewFunction>,
) -> ApiResult {
    let function = engine.functions.create(&user.user_id, request).await?;
    envelope(StatusCode::CREATED, function)
}

pub async fn get_function(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult {
    let function = engine.functions.get_owned(&user.user_id, &id).await?;
    envelope(StatusCode::OK, function)
}

pub async fn update_function(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(patch): Json<FunctionPatch>,
) -> ApiResult {
    let function = engine.functions.update(&user.user_id, &id, patch).await?;
    envelope(StatusCode::OK, function)
}

pub async fn delete_function(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult {
    engine.functions.delete(&user.user_id, &id).await?;
    envelope(StatusCode::OK, serde_json::json!({ "deleted": id }))
}
