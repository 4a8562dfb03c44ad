// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::{net::SocketAddr, sync::Arc};

use colored::Colorize;
use tokio::net::TcpListener;

use crate::{
    config::Config,
    error::RuntimeResult,
    function::{Function, FunctionsRegistry},
    http,
    monitor::Monitor,
    rate_limit::RateLimiter,
    runtime::{Compiler, ExecutionResult, Executor, Invocation, RequestContext, StoreLookup},
    store::{AccountStore, FunctionStore, MemoryStore},
    versions::VersionStore,
};

/// Shared state behind every HTTP surface.
pub struct Engine {
    pub config: Config,
    pub store: Arc<dyn FunctionStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub functions: FunctionsRegistry,
    pub versions: Arc<VersionStore>,
    pub executor: Arc<Executor>,
    pub monitor: Monitor,
    pub rate_limiter: RateLimiter,
}

impl Engine {
    /// Engine over an in-memory store. Must be called inside a tokio runtime.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    pub fn with_store<S>(config: Config, store: Arc<S>) -> anyhow::Result<Self>
    where
        S: FunctionStore + AccountStore + 'static,
    {
        let functions_store: Arc<dyn FunctionStore> = store.clone();
        let accounts: Arc<dyn AccountStore> = store;

        let lookup = Arc::new(StoreLookup::new(functions_store.clone()));
        let executor = Arc::new(Executor::new(&config.runtime, lookup)?);
        let versions = Arc::new(VersionStore::new(functions_store.clone()));
        let functions = FunctionsRegistry::new(
            functions_store.clone(),
            versions.clone(),
            executor.clone(),
            Compiler::new(config.runtime.max_source_bytes),
        );

        Ok(Self {
            monitor: Monitor::new(accounts.clone()),
            rate_limiter: RateLimiter::new(&config.rate_limit),
            store: functions_store,
            accounts,
            functions,
            versions,
            executor,
            config,
        })
    }

    /// Executes `function` with the owner's environment.
    pub async fn execute(
        &self,
        function: &Function,
        request: RequestContext,
    ) -> RuntimeResult<ExecutionResult> {
        let env = self.accounts.env_vars(&function.owner_id).await;
        let invocation = Invocation::for_function(function, request, Arc::new(env))?;
        Ok(self.executor.execute(invocation).await)
    }
}

pub struct EngineBuilder {
    config: Config,
    address: Option<String>,
    engine: Option<Arc<Engine>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            address: None,
            engine: None,
        }
    }

    pub fn config_file_or_default(mut self, path: &str) -> anyhow::Result<Self> {
        self.config = Config::from_file_or_default(path)?;
        Ok(self)
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Overrides `server.host:server.port`.
    pub fn address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    pub async fn build(mut self) -> anyhow::Result<Self> {
        let engine = Engine::new(self.config.clone())?;
        tracing::info!(
            workers = engine.executor.worker_count(),
            "Engine built"
        );
        self.engine = Some(Arc::new(engine));
        Ok(self)
    }

    pub fn engine(&self) -> Option<Arc<Engine>> {
        self.engine.clone()
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("Engine not built, call build() first"))?;
        let address = self
            .address
            .unwrap_or_else(|| engine.config.server.address());

        let listener = TcpListener::bind(&address).await?;
        let local = listener.local_addr()?;
        tracing::info!("cloudfn listening on http://{}", local.to_string().purple());
        tracing::info!("  ANY    /invoke/{{path}} - Invoke a function (authenticated)");
        tracing::info!("  ANY    /{{path}} - Invoke a published function (public)");
        tracing::info!("  *      /functions, /env, /tokens, /domains - Management API");

        let app = http::router(engine);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        tracing::info!("Server shut down");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
