// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const JWT_SECRET_ENV: &str = "CLOUDFN_JWT_SECRET";
pub const DEV_TOKEN_ENV: &str = "CLOUDFN_DEV_TOKEN";

// =============================================================================
// Root config (YAML)
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Loads config from YAML string
    pub fn from_yaml(yaml_content: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml_content)?;
        Ok(config.with_env_overrides())
    }

    /// Loads config from file, or returns default if file doesn't exist
    pub fn from_file_or_default(path: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(yaml_content) => {
                tracing::info!("Loading configuration from {}", path);
                Self::from_yaml(&yaml_content)
            }
            Err(_) => {
                tracing::info!("No {} found, using default configuration", path);
                Ok(Self::default().with_env_overrides())
            }
        }
    }

    fn with_env_overrides(mut self) -> Self {
        if let Some(secret) = non_empty_env(JWT_SECRET_ENV) {
            self.auth.jwt_secret = Some(secret);
        }
        if let Some(token) = non_empty_env(DEV_TOKEN_ENV) {
            self.auth.dev_token = Some(token);
        }
        self
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

// =============================================================================
// server
// =============================================================================

fn default_port() -> u16 {
    3000
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_timeout() -> u64 {
    30000
}

fn default_concurrency_request_limit() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Outer HTTP timeout, applied by the tower layer.
    #[serde(default = "default_timeout")]
    pub default_timeout: u64,

    #[serde(default)]
    pub cors: Option<CorsConfig>,

    #[serde(default = "default_concurrency_request_limit")]
    pub concurrency_request_limit: usize,

    /// Directory holding the IDE's `index.html`, served when no public
    /// function matches the request path.
    #[serde(default)]
    pub spa_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            default_timeout: default_timeout(),
            cors: None,
            concurrency_request_limit: default_concurrency_request_limit(),
            spa_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    #[serde(default)]
    pub allowed_methods: Vec<String>,
}

// =============================================================================
// runtime
// =============================================================================

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(1, 8)
}

fn default_execution_timeout_ms() -> u64 {
    10_000
}

fn default_max_call_depth() -> usize {
    8
}

fn default_cache_capacity() -> usize {
    512
}

fn default_max_source_bytes() -> usize {
    512 * 1024
}

fn default_loop_iteration_limit() -> u64 {
    50_000_000
}

fn default_recursion_limit() -> usize {
    512
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Number of engine worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_execution_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,

    /// Module cache entries kept per worker.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,

    #[serde(default = "default_loop_iteration_limit")]
    pub loop_iteration_limit: u64,

    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout_ms: default_execution_timeout_ms(),
            max_call_depth: default_max_call_depth(),
            cache_capacity: default_cache_capacity(),
            max_source_bytes: default_max_source_bytes(),
            loop_iteration_limit: default_loop_iteration_limit(),
            recursion_limit: default_recursion_limit(),
        }
    }
}

// =============================================================================
// auth
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// HS256 secret for bearer JWTs. Without it only API tokens and the
    /// developer bypass authenticate.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Enables the `x-dev-token` / `x-dev-user` bypass when set.
    #[serde(default)]
    pub dev_token: Option<String>,
}

// =============================================================================
// rate_limit
// =============================================================================

fn default_rate_limit_enabled() -> bool {
    true
}

fn default_requests_per_second() -> u32 {
    50
}

fn default_burst() -> u32 {
    100
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,

    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}
