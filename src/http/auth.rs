// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::{
    engine::Engine,
    error::{RuntimeError, RuntimeResult},
    function::content_hash,
    store::ApiToken,
};

pub const API_TOKEN_PREFIX: &str = "sk-";
pub const DEV_TOKEN_HEADER: &str = "x-dev-token";
pub const DEV_USER_HEADER: &str = "x-dev-user";
const DEFAULT_DEV_USER: &str = "dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Jwt,
    ApiToken,
    Dev,
}

/// Authenticated caller of the management API and `/invoke`.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub method: AuthMethod,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Credential carried by the `Authorization` header.
#[derive(Debug, PartialEq, Eq)]
pub enum Credential<'a> {
    ApiToken(&'a str),
    Bearer(&'a str),
}

/// Accepts `sk-…`, `Bearer sk-…` and `Bearer <jwt>`.
pub fn credential(headers: &HeaderMap) -> Option<Credential<'_>> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim);
    match token {
        Some(token) if token.starts_with(API_TOKEN_PREFIX) => Some(Credential::ApiToken(token)),
        Some(token) if !token.is_empty() => Some(Credential::Bearer(token)),
        Some(_) => None,
        None if value.starts_with(API_TOKEN_PREFIX) => Some(Credential::ApiToken(value)),
        None => None,
    }
}

/// Looks an `sk-` token up by its hash and stamps its last use.
pub async fn verify_api_token(engine: &Engine, token: &str) -> RuntimeResult<ApiToken> {
    let hash = content_hash(token);
    let record = engine
        .accounts
        .find_token(&hash)
        .await
        .ok_or(RuntimeError::InvalidToken)?;
    engine.accounts.touch_token(&hash).await;
    Ok(record)
}

fn verify_jwt(secret: &str, token: &str) -> RuntimeResult<String> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims.sub)
        .map_err(|e| {
            tracing::debug!(error = %e, "Rejected bearer token");
            RuntimeError::Unauthorized("Invalid or expired token".into())
        })
}

fn dev_token_matches(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(DEV_TOKEN_HEADER)
        .is_some_and(|presented| presented.as_bytes().ct_eq(expected.as_bytes()).into())
}

pub async fn authenticate(engine: &Engine, headers: &HeaderMap) -> RuntimeResult<AuthUser> {
    if let Some(expected) = engine.config.auth.dev_token.as_deref() {
        if dev_token_matches(headers, expected) {
            let user_id = headers
                .get(DEV_USER_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .unwrap_or(DEFAULT_DEV_USER);
            return Ok(AuthUser {
                user_id: user_id.to_string(),
                method: AuthMethod::Dev,
            });
        }
    }

    match credential(headers) {
        Some(Credential::ApiToken(token)) => {
            let record = verify_api_token(engine, token).await?;
            Ok(AuthUser {
                user_id: record.owner_id,
                method: AuthMethod::ApiToken,
            })
        }
        Some(Credential::Bearer(token)) => {
            let secret = engine
                .config
                .auth
                .jwt_secret
                .as_deref()
                .ok_or_else(|| RuntimeError::Unauthorized("Bearer tokens are not enabled".into()))?;
            Ok(AuthUser {
                user_id: verify_jwt(secret, token)?,
                method: AuthMethod::Jwt,
            })
        }
        None => Err(RuntimeError::Unauthorized(
            "Missing authorization token".into(),
        )),
    }
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = RuntimeError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let engine = parts
            .extensions
            .get::<Arc<Engine>>()
            .cloned()
            .ok_or_else(|| RuntimeError::Unauthorized("engine unavailable".into()))?;
        authenticate(&engine, &parts.headers).await
    }
}
