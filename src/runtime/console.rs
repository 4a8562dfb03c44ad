// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    pub fn parse(level: &str) -> Option<Self> {
        match level {
            "log" => Some(LogLevel::Log),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            "debug" => Some(LogLevel::Debug),
            _ => None,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            LogLevel::Log => "",
            LogLevel::Info => "[INFO] ",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Error => "[ERROR] ",
            LogLevel::Debug => "[DEBUG] ",
        }
    }
}

/// One argument of a console call, already converted out of the JS engine.
#[derive(Debug, Clone, PartialEq)]
pub enum LogArg {
    Undefined,
    Null,
    /// A primitive rendered with JS `String()`.
    Text(String),
    /// An object or array, rendered as pretty JSON.
    Json(Value),
}

impl LogArg {
    fn render(&self) -> String {
        match self {
            LogArg::Undefined => "undefined".to_string(),
            LogArg::Null => "null".to_string(),
            LogArg::Text(text) => text.clone(),
            LogArg::Json(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

impl From<&str> for LogArg {
    fn from(text: &str) -> Self {
        LogArg::Text(text.to_string())
    }
}

impl From<Value> for LogArg {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => LogArg::Null,
            Value::String(text) => LogArg::Text(text),
            Value::Bool(b) => LogArg::Text(b.to_string()),
            Value::Number(n) => LogArg::Text(n.to_string()),
            other => LogArg::Json(other),
        }
    }
}

/// Log sink owned by a single invocation.
#[derive(Debug, Default, Clone)]
pub struct ExecutionConsole {
    lines: Vec<String>,
}

impl ExecutionConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn format(args: &[LogArg]) -> String {
        args.iter()
            .map(LogArg::render)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn write(&mut self, level: LogLevel, args: &[LogArg]) {
        let line = format!("{}{}", level.prefix(), Self::format(args));
        self.lines.push(line);
    }

    pub fn log(&mut self, args: &[LogArg]) {
        self.write(LogLevel::Log, args);
    }

    pub fn info(&mut self, args: &[LogArg]) {
        self.write(LogLevel::Info, args);
    }

    pub fn warn(&mut self, args: &[LogArg]) {
        self.write(LogLevel::Warn, args);
    }

    pub fn error(&mut self, args: &[LogArg]) {
        self.write(LogLevel::Error, args);
    }

    pub fn debug(&mut self, args: &[LogArg]) {
        self.write(LogLevel::Debug, args);
    }

    pub fn logs(&self) -> Vec<String> {
        self.lines.clone()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn into_logs(self) -> Vec<String> {
        self.lines
    }
}
