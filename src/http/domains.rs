// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Request, State},
    http::{StatusCode, Uri, header::HOST, uri::PathAndQuery},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use serde::Deserialize;

use super::{ApiResult, AuthUser, envelope};
use crate::{
    engine::Engine,
    error::RuntimeError,
    function::normalize_path,
    store::CustomDomain,
};

/// Owner of the verified custom domain a request arrived on.
#[derive(Debug, Clone)]
pub struct DomainOwner {
    pub domain: String,
    pub owner_id: String,
}

fn request_host(request: &Request) -> Option<String> {
    let host = request
        .uri()
        .host()
        .map(str::to_string)
        .or_else(|| {
            request
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })?;
    let host = host.split(':').next().unwrap_or_default().trim().to_lowercase();
    (!host.is_empty()).then_some(host)
}

/// Path a verified domain maps `path` to: the configured target, or the
/// request path itself.
fn rewritten_path(domain: &CustomDomain, path: &str) -> String {
    match domain.target_path.as_deref() {
        Some(target) => format!("/{}", target.trim_matches('/')),
        None => format!("/{}", path.trim_start_matches('/')),
    }
}

fn rewrite_uri(uri: &Uri, path: &str) -> Option<Uri> {
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query).ok()?);
    Uri::from_parts(parts).ok()
}

/// Rewrites requests arriving on a verified custom domain and tags them
/// with the domain owner. Unknown and unverified hosts pass through.
pub async fn rewrite_custom_domain(
    State(engine): State<Arc<Engine>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(host) = request_host(&request) else {
        return next.run(request).await;
    };
    let domain = match engine.accounts.get_domain(&host).await {
        Some(domain) if domain.verified => domain,
        _ => return next.run(request).await,
    };

    let path = rewritten_path(&domain, request.uri().path());
    match rewrite_uri(request.uri(), &path) {
        Some(uri) => {
            tracing::debug!(
                domain = %domain.domain,
                from = %request.uri().path(),
                to = %path,
                "Rewrote custom domain request"
            );
            *request.uri_mut() = uri;
        }
        None => {
            tracing::warn!(domain = %domain.domain, path = %path, "Invalid custom domain target");
        }
    }
    request.extensions_mut().insert(DomainOwner {
        domain: domain.domain,
        owner_id: domain.owner_id,
    });
    next.run(request).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddDomainRequest {
    pub domain: String,
    #[serde(default)]
    pub target_path: Option<String>,
}

fn normalize_domain(domain: &str) -> Result<String, RuntimeError> {
    let domain = domain.trim().trim_end_matches('.').to_lowercase();
    let valid = !domain.is_empty()
        && domain.contains('.')
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if valid {
        Ok(domain)
    } else {
        Err(RuntimeError::InvalidInput(format!("invalid domain: {domain}")))
    }
}

pub async fn list_domains(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
) -> ApiResult {
    envelope(StatusCode::OK, engine.accounts.list_domains(&user.user_id).await)
}

pub async fn add_domain(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Json(payload): Json<AddDomainRequest>,
) -> ApiResult {
    let domain = CustomDomain {
        domain: normalize_domain(&payload.domain)?,
        owner_id: user.user_id,
        target_path: payload
            .target_path
            .as_deref()
            .map(normalize_path)
            .transpose()?,
        verified: false,
        created_at: Utc::now(),
    };
    engine.accounts.insert_domain(domain.clone()).await?;

    tracing::info!(domain = %domain.domain, "Custom domain added");
    envelope(StatusCode::CREATED, domain)
}

/// Marks a domain as verified. Ownership of the DNS name is confirmed out
/// of band.
pub async fn verify_domain(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Path(domain): Path<String>,
) -> ApiResult {
    let domain = normalize_domain(&domain)?;
    let mut record = match engine.accounts.get_domain(&domain).await {
        Some(record) if record.owner_id == user.user_id => record,
        _ => return Err(RuntimeError::InvalidInput(format!("unknown domain: {domain}"))),
    };
    record.verified = true;
    engine.accounts.update_domain(record.clone()).await?;

    tracing::info!(domain = %record.domain, "Custom domain verified");
    envelope(StatusCode::OK, record)
}

pub async fn delete_domain(
    Extension(engine): Extension<Arc<Engine>>,
    user: AuthUser,
    Path(domain): Path<String>,
) -> ApiResult {
    let domain = normalize_domain(&domain)?;
    if !engine.accounts.delete_domain(&user.user_id, &domain).await {
        return Err(RuntimeError::InvalidInput(format!("unknown domain: {domain}")));
    }
    envelope(StatusCode::OK, serde_json::json!({ "deleted": domain }))
}
