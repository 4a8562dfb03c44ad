// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use memory::MemoryStore;

use crate::{
    error::RuntimeResult,
    function::{Function, FunctionVersion},
};

/// Persistence of functions and their version history.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    /// Fails with `Conflict` when the owner already has a function at the path.
    async fn insert_function(&self, function: Function) -> RuntimeResult<()>;
    /// Replaces a stored function, keeping the per-owner path index in sync.
    async fn update_function(&self, function: Function) -> RuntimeResult<()>;
    async fn get_function(&self, id: &str) -> Option<Function>;
    async fn find_by_path(&self, owner_id: &str, path: &str) -> Option<Function>;
    async fn find_by_name(&self, owner_id: &str, name: &str) -> Option<Function>;
    /// Published function by path across owners, or within one owner.
    async fn find_published_by_path(&self, path: &str, owner_id: Option<&str>) -> Option<Function>;
    async fn find_published_by_name(&self, name: &str, owner_id: Option<&str>) -> Option<Function>;
    async fn list_functions(&self, owner_id: &str) -> Vec<Function>;
    async fn published_functions(&self, owner_id: &str) -> Vec<Function>;
    /// Deletes the function and every version it owns.
    async fn delete_function(&self, id: &str) -> Option<Function>;

    /// Conditional insert; fails with `Conflict` when the version number is taken.
    async fn insert_version(&self, version: FunctionVersion) -> RuntimeResult<()>;
    async fn max_version(&self, function_id: &str) -> u32;
    /// Versions of a function, highest first.
    async fn list_versions(&self, function_id: &str) -> Vec<FunctionVersion>;
    async fn get_version(&self, function_id: &str, version: u32) -> Option<FunctionVersion>;
}

/// Per-owner account data: API tokens, custom domains, environment variables
/// and the audit trail.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn insert_token(&self, token: ApiToken) -> RuntimeResult<()>;
    async fn find_token(&self, token_hash: &str) -> Option<ApiToken>;
    async fn list_tokens(&self, owner_id: &str) -> Vec<ApiToken>;
    async fn delete_token(&self, owner_id: &str, id: &str) -> bool;
    async fn touch_token(&self, token_hash: &str);

    async fn insert_domain(&self, domain: CustomDomain) -> RuntimeResult<()>;
    async fn get_domain(&self, domain: &str) -> Option<CustomDomain>;
    async fn list_domains(&self, owner_id: &str) -> Vec<CustomDomain>;
    async fn update_domain(&self, domain: CustomDomain) -> RuntimeResult<()>;
    async fn delete_domain(&self, owner_id: &str, domain: &str) -> bool;

    async fn env_vars(&self, owner_id: &str) -> HashMap<String, String>;
    async fn set_env_vars(&self, owner_id: &str, vars: HashMap<String, String>);

    async fn append_audit(&self, record: AuditRecord) -> RuntimeResult<()>;
    async fn audit_records(&self, owner_id: &str) -> Vec<AuditRecord>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiToken {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    /// First characters of the plaintext token, for display.
    pub prefix: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomDomain {
    pub domain: String,
    pub owner_id: String,
    pub target_path: Option<String>,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Invoke,
    Public,
    CustomDomain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: String,
    pub function_id: String,
    pub owner_id: String,
    pub trigger: TriggerKind,
    pub request: Value,
    pub response: Value,
    pub logs: Vec<String>,
    pub duration_ms: u64,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}
