// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{Extensions, HeaderMap, HeaderValue, header::RETRY_AFTER},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::auth::{self, Credential, DEV_USER_HEADER};
use crate::{engine::Engine, error::RuntimeError, function::content_hash, rate_limit::RateDecision};

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Bucket key: the presented credential, the dev user, or the client address.
fn client_key(headers: &HeaderMap, extensions: &Extensions) -> String {
    match auth::credential(headers) {
        Some(Credential::ApiToken(token)) | Some(Credential::Bearer(token)) => {
            return format!("token:{}", content_hash(token));
        }
        None => {}
    }
    if let Some(user) = headers.get(DEV_USER_HEADER).and_then(|v| v.to_str().ok()) {
        return format!("dev:{user}");
    }
    if let Some(ConnectInfo(addr)) = extensions.get::<ConnectInfo<SocketAddr>>() {
        return format!("ip:{}", addr.ip());
    }
    forwarded_for(headers)
        .map(|ip| format!("ip:{ip}"))
        .unwrap_or_else(|| "anonymous".to_string())
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

pub(super) fn apply_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(decision.reset_secs));
}

/// Takes one token from the caller's bucket. `Ok(None)` when limiting is
/// off, `Err` with the ready 429 response when the bucket is empty.
pub(super) fn admit(
    engine: &Engine,
    headers: &HeaderMap,
    extensions: &Extensions,
) -> Result<Option<RateDecision>, Response> {
    if !engine.rate_limiter.is_enabled() {
        return Ok(None);
    }

    let key = client_key(headers, extensions);
    let decision = engine.rate_limiter.check(&key);
    if !decision.allowed {
        tracing::debug!(key = %key, retry_after_ms = decision.retry_after_ms, "Rate limited");
        let mut response = RuntimeError::RateLimitExceeded {
            retry_after_ms: decision.retry_after_ms,
        }
        .into_response();
        let retry_secs = decision.retry_after_ms.div_ceil(1000).max(1);
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(retry_secs));
        apply_headers(response.headers_mut(), &decision);
        return Err(response);
    }
    Ok(Some(decision))
}

/// Route layer for `/invoke`. Public functions are admitted inside their
/// handler, once the path is known to name one.
pub async fn enforce(State(engine): State<Arc<Engine>>, request: Request, next: Next) -> Response {
    let decision = match admit(&engine, request.headers(), request.extensions()) {
        Ok(decision) => decision,
        Err(limited) => return limited,
    };

    let mut response = next.run(request).await;
    if let Some(decision) = decision {
        apply_headers(response.headers_mut(), &decision);
    }
    response
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::header::AUTHORIZATION};

    use super::*;

    fn key_for(headers: &[(&str, &str)]) -> String {
        let mut builder = Request::builder().uri("/hello");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Body::empty()).unwrap();
        client_key(request.headers(), request.extensions())
    }

    #[test]
    fn credentials_take_precedence_over_addresses() {
        let key = key_for(&[
            (AUTHORIZATION.as_str(), "sk-abc"),
            ("x-forwarded-for", "10.0.0.1"),
        ]);
        assert_eq!(key, format!("token:{}", content_hash("sk-abc")));
    }

    #[test]
    fn first_forwarded_address_is_used() {
        let key = key_for(&[("x-forwarded-for", "10.0.0.1, 10.0.0.2")]);
        assert_eq!(key, "ip:10.0.0.1");
        assert_eq!(key_for(&[]), "anonymous");
    }
}
