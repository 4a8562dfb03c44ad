// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

pub mod bridge;
pub mod cache;
pub mod compiler;
pub mod console;
mod executor;
mod isolate;

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use bridge::{CloudBridge, FunctionLookup, StoreLookup};
pub use cache::{CacheScope, CacheStats, ModuleCache, ModuleKey};
pub use compiler::{CompileError, CompileOutcome, Compiler};
pub use console::{ExecutionConsole, LogArg, LogLevel};
pub use executor::Executor;
pub use isolate::Isolate;

use crate::{
    error::{RuntimeError, RuntimeResult},
    function::{Function, content_hash},
};

/// The `ctx` a function's default export receives, minus the injected
/// `cloud` and `console` members.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Everything an engine worker needs to run one function.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub function_id: String,
    pub owner_id: Option<String>,
    pub name: String,
    pub path: String,
    pub compiled: String,
    pub hash: String,
    pub request: RequestContext,
    pub env: Arc<HashMap<String, String>>,
}

impl Invocation {
    /// The cache key is the hash of the compiled artifact, so an entry can
    /// never be reused for different compiled code.
    pub fn for_function(
        function: &Function,
        request: RequestContext,
        env: Arc<HashMap<String, String>>,
    ) -> RuntimeResult<Self> {
        let compiled = function
            .compiled
            .clone()
            .ok_or_else(|| RuntimeError::NotCompiled(function.name.clone()))?;
        Ok(Self {
            function_id: function.id.clone(),
            owner_id: Some(function.owner_id.clone()),
            name: function.name.clone(),
            path: function.path.clone(),
            hash: content_hash(&compiled),
            compiled,
            request,
            env,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub data: Option<Value>,
    pub logs: Vec<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn failed(message: impl Into<String>, logs: Vec<String>, elapsed: Duration) -> Self {
        Self {
            data: None,
            logs,
            duration_ms: elapsed.as_millis() as u64,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
