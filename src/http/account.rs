// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::{collections::HashMap, sync::Arc};

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiResult, AuthUser, auth::API_TOKEN_PREFIX, envelope};
use crate::{
    engine::Engine,
    error::RuntimeError,
    function::content_hash,
    store::ApiToken,
};

/// Characters of the plaintext kept for display.
const TOKEN_PREFIX_LEN: usize = 10;

pub async fn get_env(Extension(engine): Extension<Arc<Engine>>, user: AuthUser) -> ApiResult {
    envelope(StatusCode::OK, engine.accounts.env_vars(&user.user_id).await)
}

/// Replaces the owner's environment wholesale.
pub async fn put_env(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Json(vars): Json<HashMap<String, String>>,
) -> ApiResult {
    if let Some(key) = vars.keys().find(|k| k.trim().is_empty() || k.contains('=')) {
        return Err(RuntimeError::InvalidInput(format!(
            "invalid environment variable name: {key:?}"
        )));
    }
    engine.accounts.set_env_vars(&user.user_id, vars.clone()).await;

    tracing::debug!(owner_id = %user.user_id, count = vars.len(), "Environment updated");
    envelope(StatusCode::OK, vars)
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateTokenRequest {
    #[serde(default)]
    pub name: Option<String>,
}

/// Returned once on creation; only the hash is stored.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedToken {
    #[serde(flatten)]
    pub record: ApiToken,
    pub token: String,
}

pub async fn list_tokens(Extension(engine): Extension<Arc<Engine>>, user: AuthUser) -> ApiResult {
    envelope(StatusCode::OK, engine.accounts.list_tokens(&user.user_id).await)
}

pub async fn create_token(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Json(request): Json<CreateTokenRequest>,
) -> ApiResult {
    let token = format!("{}{}", API_TOKEN_PREFIX, Uuid::new_v4().simple());
    let record = ApiToken {
        id: Uuid::new_v4().to_string(),
        owner_id: user.user_id,
        name: request
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "default".to_string()),
        token_hash: content_hash(&token),
        prefix: token.chars().take(TOKEN_PREFIX_LEN).collect(),
        created_at: Utc::now(),
        last_used_at: None,
    };
    engine.accounts.insert_token(record.clone()).await?;

    tracing::info!(token_id = %record.id, name = %record.name, "API token created");
    envelope(StatusCode::CREATED, CreatedToken { record, token })
}

pub async fn delete_token(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult {
    if !engine.accounts.delete_token(&user.user_id, &id).await {
        return Err(RuntimeError::InvalidInput(format!("unknown token: {id}")));
    }
    envelope(StatusCode::OK, serde_json::json!({ "deleted": id }))
}
