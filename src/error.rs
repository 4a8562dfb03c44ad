// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use thiserror::Error;

use crate::{protocol::ErrorBody, runtime::compiler::CompileError};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("failed to load module {name}: {message}")]
    Load { name: String, message: String },

    #[error("Function {0} must export a default function")]
    ExportShape(String),

    #[error("{0}")]
    Execution(String),

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("function not compiled: {0}")]
    NotCompiled(String),

    #[error("version {version} not found for function {function_id}")]
    VersionNotFound { function_id: String, version: u32 },

    #[error("This function requires an API token")]
    TokenRequired,

    #[error("Invalid API token")]
    InvalidToken,

    #[error("{0}")]
    Unauthorized(String),

    #[error("Rate limit exceeded, retry in {retry_after_ms}ms")]
    RateLimitExceeded { retry_after_ms: u64 },

    #[error("CallCycleError: maximum call depth of {limit} exceeded ({chain})")]
    CallCycle { limit: usize, chain: String },

    #[error("Timeout: function exceeded {0}ms")]
    Timeout(u64),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl RuntimeError {
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::Compile(_) => "COMPILE_ERROR",
            RuntimeError::Load { .. }
            | RuntimeError::ExportShape(_)
            | RuntimeError::Execution(_)
            | RuntimeError::CallCycle { .. }
            | RuntimeError::Timeout(_) => "EXECUTION_ERROR",
            RuntimeError::FunctionNotFound(_) => "FUNCTION_NOT_FOUND",
            RuntimeError::NotCompiled(_) => "NOT_COMPILED",
            RuntimeError::VersionNotFound { .. } => "VERSION_NOT_FOUND",
            RuntimeError::TokenRequired => "TOKEN_REQUIRED",
            RuntimeError::InvalidToken => "INVALID_TOKEN",
            RuntimeError::Unauthorized(_) => "UNAUTHORIZED",
            RuntimeError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            RuntimeError::Conflict(_) => "CONFLICT",
            RuntimeError::InvalidInput(_) => "INVALID_INPUT",
            RuntimeError::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.to_string())
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
