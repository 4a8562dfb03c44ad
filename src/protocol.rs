// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire shape of every error the HTTP surfaces report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// `{success, data?, error?}` envelope used by the authenticated and
/// management surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Envelope {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: ErrorBody) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Error envelope of the public surface, which reports only a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicFailure {
    pub success: bool,
    pub error: PublicErrorMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicErrorMessage {
    pub message: String,
}

impl PublicFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: PublicErrorMessage {
                message: message.into(),
            },
        }
    }
}
