// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    error::{RuntimeError, RuntimeResult},
    runtime::{CacheScope, Compiler, Executor, ModuleKey},
    store::FunctionStore,
    versions::VersionStore,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    pub id: String,
    pub owner_id: String,
    /// Leaf label, the last path segment by default.
    pub name: String,
    /// Slash-joined route, unique per owner.
    pub path: String,
    pub code: String,
    pub compiled: Option<String>,
    pub hash: String,
    pub published: bool,
    pub published_version: Option<u32>,
    pub published_at: Option<DateTime<Utc>>,
    pub require_token: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Function {
    pub fn new(owner_id: &str, name: &str, path: &str, code: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            path: path.to_string(),
            code: code.to_string(),
            compiled: None,
            hash: content_hash(code),
            published: false,
            published_version: None,
            published_at: None,
            require_token: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn module_key(&self) -> ModuleKey {
        ModuleKey::new(Some(&self.owner_id), &self.name)
    }
}

/// Immutable snapshot written on publish and rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionVersion {
    pub function_id: String,
    pub version: u32,
    pub code: String,
    pub compiled: String,
    pub changelog: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// SHA-256 hex digest of function source.
pub fn content_hash(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

/// Normalises a route path to slash-joined segments without leading or
/// trailing slashes.
pub fn normalize_path(path: &str) -> RuntimeResult<String> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(RuntimeError::InvalidInput("path must not be empty".into()));
    }
    for segment in &segments {
        let valid = segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid || *segment == "." || *segment == ".." {
            return Err(RuntimeError::InvalidInput(format!(
                "invalid path segment: {}",
                segment
            )));
        }
    }
    Ok(segments.join("/"))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFunction {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub require_token: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionPatch {
    pub name: Option<String>,
    pub path: Option<String>,
    pub code: Option<String>,
    pub require_token: Option<bool>,
}

/// Owner-scoped function lifecycle: create, edit, publish, roll back, delete.
///
/// Every mutation that can change what a worker would execute invalidates
/// the affected module cache entries.
pub struct FunctionsRegistry {
    store: Arc<dyn FunctionStore>,
    versions: Arc<VersionStore>,
    executor: Arc<Executor>,
    compiler: Compiler,
}

impl FunctionsRegistry {
    pub fn new(
        store: Arc<dyn FunctionStore>,
        versions: Arc<VersionStore>,
        executor: Arc<Executor>,
        compiler: Compiler,
    ) -> Self {
        Self {
            store,
            versions,
            executor,
            compiler,
        }
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub async fn list(&self, owner_id: &str) -> Vec<Function> {
        self.store.list_functions(owner_id).await
    }

    /// Function owned by `owner_id`; foreign functions read as missing.
    pub async fn get_owned(&self, owner_id: &str, id: &str) -> RuntimeResult<Function> {
        match self.store.get_function(id).await {
            Some(function) if function.owner_id == owner_id => Ok(function),
            _ => Err(RuntimeError::FunctionNotFound(id.to_string())),
        }
    }

    pub async fn create(&self, owner_id: &str, request: NewFunction) -> RuntimeResult<Function> {
        let path = normalize_path(request.path.as_deref().unwrap_or(&request.name))?;
        let name = match request.name.trim() {
            "" => path.rsplit('/').next().unwrap_or(&path).to_string(),
            name => name.to_string(),
        };

        let mut function = Function::new(owner_id, &name, &path, &request.code);
        function.require_token = request.require_token;
        self.store.insert_function(function.clone()).await?;

        tracing::info!(
            "{} Function {}",
            "[REGISTERED]".green(),
            function.path.purple()
        );
        Ok(function)
    }

    pub async fn update(
        &self,
        owner_id: &str,
        id: &str,
        patch: FunctionPatch,
    ) -> RuntimeResult<Function> {
        // Only owners may create lock entries; the record is re-read under it.
        self.get_owned(owner_id, id).await?;
        let _guard = self.versions.lock(id).await;
        let mut function = self.get_owned(owner_id, id).await?;
        let previous_key = function.module_key();

        if let Some(name) = patch.name.filter(|n| !n.trim().is_empty()) {
            function.name = name.trim().to_string();
        }
        if let Some(path) = patch.path {
            function.path = normalize_path(&path)?;
        }
        if let Some(code) = patch.code {
            function.hash = content_hash(&code);
            function.code = code;
        }
        if let Some(require_token) = patch.require_token {
            function.require_token = require_token;
        }
        function.updated_at = Utc::now();

        self.store.update_function(function.clone()).await?;
        self.executor.clear_cache(CacheScope::Entry(previous_key));
        self.executor.clear_cache(CacheScope::Entry(function.module_key()));

        tracing::debug!(function_id = %function.id, "Function updated");
        Ok(function)
    }

    pub async fn delete(&self, owner_id: &str, id: &str) -> RuntimeResult<()> {
        let function = self.get_owned(owner_id, id).await?;
        self.store.delete_function(&function.id).await;
        self.executor.clear_cache(CacheScope::Entry(function.module_key()));

        tracing::info!("{} Function {}", "[REMOVED]".red(), function.path.purple());
        Ok(())
    }

    /// Compiles the live code, stores the artifact on the function and
    /// snapshots it as a new version. Compile errors are returned before
    /// anything is written. Edits wait until the publish is complete.
    pub async fn publish(
        &self,
        owner_id: &str,
        id: &str,
        changelog: Option<String>,
    ) -> RuntimeResult<FunctionVersion> {
        self.get_owned(owner_id, id).await?;
        let guard = self.versions.lock(id).await;
        let mut function = self.get_owned(owner_id, id).await?;
        let compiled = self.compiler.compile(&function.code)?;

        function.compiled = Some(compiled.clone());
        function.hash = content_hash(&function.code);
        function.updated_at = Utc::now();
        self.store.update_function(function.clone()).await?;

        let version = self
            .versions
            .append_version(
                &guard,
                &function.id,
                &function.code,
                &compiled,
                changelog,
                owner_id,
            )
            .await?;
        drop(guard);
        self.executor.clear_cache(CacheScope::Entry(function.module_key()));

        tracing::info!(
            "{} Function {} v{}",
            "[PUBLISHED]".green(),
            function.path.purple(),
            version.version
        );
        Ok(version)
    }

    pub async fn rollback(
        &self,
        owner_id: &str,
        id: &str,
        target: u32,
    ) -> RuntimeResult<FunctionVersion> {
        let function = self.get_owned(owner_id, id).await?;
        let version = self
            .versions
            .rollback_to_version(&function.id, target, owner_id)
            .await?;
        self.executor.clear_cache(CacheScope::Entry(function.module_key()));

        tracing::info!(
            "{} Function {} to v{} (now v{})",
            "[ROLLED BACK]".yellow(),
            function.path.purple(),
            target,
            version.version
        );
        Ok(version)
    }
}
