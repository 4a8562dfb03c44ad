// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::{collections::HashMap, sync::Arc};

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    function::Function,
    runtime::ExecutionResult,
    store::{AccountStore, AuditRecord, TriggerKind},
};

const EVENT_CAPACITY: usize = 1024;

const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "api-key",
    "x-auth-token",
    "x-access-token",
    "x-dev-token",
    "x-secret",
    "proxy-authorization",
];

/// Emitted once per completed invocation on any surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub function_id: String,
    pub owner_id: String,
    pub success: bool,
    pub duration_ms: u64,
    pub trigger: TriggerKind,
    pub completed_at: DateTime<Utc>,
}

/// Request summary kept in the audit trail.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

pub fn sanitize_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let name_lower = name.as_str().to_lowercase();
            let sanitized = if SENSITIVE_HEADERS.contains(&name_lower.as_str()) {
                "[REDACTED]".to_string()
            } else {
                value.to_str().unwrap_or("[non-utf8]").to_string()
            };
            (name.to_string(), sanitized)
        })
        .collect()
}

/// Fans execution events out to subscribers and writes the audit trail.
/// Neither path can fail or delay the response that triggered it.
pub struct Monitor {
    events: broadcast::Sender<ExecutionEvent>,
    accounts: Arc<dyn AccountStore>,
}

impl Monitor {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { events, accounts }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub fn record(
        &self,
        function: &Function,
        trigger: TriggerKind,
        request: AuditRequest,
        result: &ExecutionResult,
    ) {
        let event = ExecutionEvent {
            function_id: function.id.clone(),
            owner_id: function.owner_id.clone(),
            success: result.is_success(),
            duration_ms: result.duration_ms,
            trigger,
            completed_at: Utc::now(),
        };
        if self.events.send(event).is_err() {
            tracing::trace!(function_id = %function.id, "No execution event subscribers");
        }

        let record = AuditRecord {
            id: Uuid::new_v4().to_string(),
            function_id: function.id.clone(),
            owner_id: function.owner_id.clone(),
            trigger,
            request: serde_json::to_value(&request).unwrap_or(Value::Null),
            response: match &result.error {
                Some(message) => json!({ "error": message }),
                None => json!({ "data": result.data }),
            },
            logs: result.logs.clone(),
            duration_ms: result.duration_ms,
            success: result.is_success(),
            created_at: Utc::now(),
        };
        let accounts = self.accounts.clone();
        tokio::spawn(async move {
            if let Err(err) = accounts.append_audit(record).await {
                tracing::warn!(error = %err, "Failed to write audit record");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn sensitive_headers_are_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("sk-secret"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        let sanitized = sanitize_headers(&headers);
        assert_eq!(sanitized["authorization"], "[REDACTED]");
        assert_eq!(sanitized["x-request-id"], "abc");
    }

    #[tokio::test]
    async fn record_broadcasts_and_audits() {
        let store = Arc::new(MemoryStore::new());
        let monitor = Monitor::new(store.clone());
        let mut events = monitor.subscribe();
        let function = Function::new("u1", "hello", "hello", "");
        let result = ExecutionResult {
            data: Some(json!("world")),
            logs: vec!["hi".into()],
            duration_ms: 3,
            error: None,
        };

        monitor.record(&function, TriggerKind::Public, AuditRequest::default(), &result);

        let event = events.recv().await.unwrap();
        assert_eq!(event.function_id, function.id);
        assert!(event.success);
        assert_eq!(event.trigger, TriggerKind::Public);

        for _ in 0..50 {
            if !store.audit_records("u1").await.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let records = store.audit_records("u1").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].logs, vec!["hi".to_string()]);
        assert_eq!(records[0].response, json!({"data": "world"}));
    }
}
