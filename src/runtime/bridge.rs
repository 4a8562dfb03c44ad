// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use tokio::runtime::Handle;

use super::{Invocation, RequestContext};
use crate::{
    error::{RuntimeError, RuntimeResult},
    function::Function,
    store::FunctionStore,
};

/// Synchronous view of an owner's functions, used from engine worker threads
/// where no async runtime is driving the call.
pub trait FunctionLookup: Send + Sync {
    /// Looks a function up by name first, then by path.
    fn find_function(&self, owner_id: &str, name: &str) -> Option<Function>;
    fn published_functions(&self, owner_id: &str) -> Vec<Function>;
}

/// [`FunctionLookup`] over a [`FunctionStore`], blocking on the server's
/// runtime handle. Only call it from threads that are not runtime workers.
pub struct StoreLookup {
    store: Arc<dyn FunctionStore>,
    handle: Handle,
}

impl StoreLookup {
    /// Captures the current runtime handle; panics outside a tokio runtime.
    pub fn new(store: Arc<dyn FunctionStore>) -> Self {
        Self::with_handle(store, Handle::current())
    }

    pub fn with_handle(store: Arc<dyn FunctionStore>, handle: Handle) -> Self {
        Self { store, handle }
    }
}

impl FunctionLookup for StoreLookup {
    fn find_function(&self, owner_id: &str, name: &str) -> Option<Function> {
        self.handle.block_on(async {
            match self.store.find_by_name(owner_id, name).await {
                Some(function) => Some(function),
                None => self.store.find_by_path(owner_id, name).await,
            }
        })
    }

    fn published_functions(&self, owner_id: &str) -> Vec<Function> {
        self.handle
            .block_on(self.store.published_functions(owner_id))
    }
}

/// The `ctx.cloud` scope of one frame: the owner, their environment and the
/// chain of function names that led to this call.
#[derive(Debug, Clone)]
pub struct CloudBridge {
    owner_id: Option<String>,
    env: Arc<HashMap<String, String>>,
    chain: Vec<String>,
    max_depth: usize,
}

impl CloudBridge {
    pub fn new(
        owner_id: Option<String>,
        env: Arc<HashMap<String, String>>,
        root: &str,
        max_depth: usize,
    ) -> Self {
        Self {
            owner_id,
            env,
            chain: vec![root.to_string()],
            max_depth,
        }
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    pub fn env_json(&self) -> String {
        serde_json::to_string(self.env.as_ref()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Number of nested `cloud.invoke` calls above the root frame.
    pub fn depth(&self) -> usize {
        self.chain.len() - 1
    }

    /// Resolves a callee inside the caller's owner scope.
    pub fn resolve(&self, lookup: &dyn FunctionLookup, name: &str) -> RuntimeResult<Function> {
        let Some(owner_id) = self.owner_id.as_deref() else {
            return Err(RuntimeError::FunctionNotFound(name.to_string()));
        };
        let function = lookup
            .find_function(owner_id, name)
            .ok_or_else(|| RuntimeError::FunctionNotFound(name.to_string()))?;
        if function.compiled.is_none() {
            return Err(RuntimeError::NotCompiled(name.to_string()));
        }
        Ok(function)
    }

    /// Scope of a nested call to `callee`, or `CallCycle` once the chain is
    /// already `max_depth` calls deep.
    pub fn enter(&self, callee: &str) -> RuntimeResult<CloudBridge> {
        let mut chain = self.chain.clone();
        chain.push(callee.to_string());
        if self.depth() >= self.max_depth {
            return Err(RuntimeError::CallCycle {
                limit: self.max_depth,
                chain: chain.join(" -> "),
            });
        }
        Ok(CloudBridge {
            owner_id: self.owner_id.clone(),
            env: self.env.clone(),
            chain,
            max_depth: self.max_depth,
        })
    }

    /// Invocation of `callee` with `body = data` and empty query and headers.
    pub fn invocation(&self, callee: &Function, data: Value) -> RuntimeResult<Invocation> {
        let mut invocation = Invocation::for_function(
            callee,
            RequestContext {
                body: data,
                ..Default::default()
            },
            self.env.clone(),
        )?;
        invocation.owner_id = self.owner_id.clone();
        Ok(invocation)
    }
}
