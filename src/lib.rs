// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

pub mod config;
pub mod engine;
pub mod error;
pub mod function;
pub mod http;
pub mod logging;
pub mod monitor;
pub mod protocol;
pub mod rate_limit;
pub mod runtime;
pub mod store;
pub mod versions;

pub use engine::{Engine, EngineBuilder};
pub use error::{RuntimeError, RuntimeResult};
