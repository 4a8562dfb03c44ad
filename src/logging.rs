// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::{fmt, sync::OnceLock};

use colored::{ColoredString, Colorize};
use serde_json::Value;
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self as tracing_fmt, FmtContext, FormatEvent, FormatFields},
    registry::LookupSpan,
};

const INDENT: &str = "    ";

/// Event fields, with the message split out and everything else rendered
/// as JSON values.
#[derive(Default)]
struct EventFields {
    message: Option<String>,
    fields: Vec<(&'static str, Value)>,
}

impl EventFields {
    fn push(&mut self, field: &Field, value: Value) {
        self.fields.push((field.name(), value));
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.push(field, Value::from(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(rendered);
            return;
        }
        // `%display` values of JSON payloads (request bodies, function
        // results) are expanded into a tree.
        let value = match serde_json::from_str::<Value>(&rendered) {
            Ok(json @ (Value::Object(_) | Value::Array(_))) => json,
            _ => Value::String(rendered),
        };
        self.push(field, value);
    }
}

fn scalar(value: &Value) -> ColoredString {
    match value {
        Value::String(s) => s.cyan(),
        Value::Number(n) => n.to_string().yellow(),
        Value::Bool(b) => b.to_string().purple(),
        Value::Null => "null".bright_black(),
        Value::Object(_) | Value::Array(_) => value.to_string().normal(),
    }
}

/// Writes `value` as an indented branch tree below the current line.
fn write_tree(out: &mut String, value: &Value, depth: usize) {
    let entries: Vec<(Option<&str>, &Value)> = match value {
        Value::Object(map) => map.iter().map(|(k, v)| (Some(k.as_str()), v)).collect(),
        Value::Array(items) => items.iter().map(|v| (None, v)).collect(),
        _ => {
            out.push_str(&scalar(value).to_string());
            return;
        }
    };
    if entries.is_empty() {
        let empty = if value.is_object() { "{}" } else { "[]" };
        out.push_str(&empty.bright_black().to_string());
        return;
    }

    let pad = INDENT.repeat(depth);
    let last = entries.len() - 1;
    for (i, (key, child)) in entries.into_iter().enumerate() {
        let branch = if i == last { "└" } else { "├" };
        out.push('\n');
        out.push_str(&pad);
        out.push_str(branch);
        out.push(' ');
        if let Some(key) = key {
            out.push_str(&format!("{}: ", key.white()));
        }
        write_tree(out, child, depth + 1);
    }
}

fn render_fields(fields: &[(&'static str, Value)]) -> String {
    let mut out = String::new();
    let last = fields.len().saturating_sub(1);
    for (i, (name, value)) in fields.iter().enumerate() {
        let branch = if i == last { "└" } else { "├" };
        out.push_str(&format!("\n{}{} {}: ", INDENT, branch, name.white()));
        write_tree(&mut out, value, 2);
    }
    out
}

fn level_label(level: &Level) -> ColoredString {
    match *level {
        Level::TRACE => "TRACE".purple(),
        Level::DEBUG => "DEBUG".green(),
        Level::INFO => "INFO".blue(),
        Level::WARN => "WARN".yellow(),
        Level::ERROR => "ERROR".red(),
    }
}

struct CloudfnLogFormatter;

impl<S, N> FormatEvent<S, N> for CloudfnLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: tracing_fmt::format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();

        write!(writer, "{} ", chrono::Utc::now().to_rfc3339().dimmed())?;
        write!(writer, "[{}] ", level_label(meta.level()))?;
        write!(writer, "{}", meta.target().cyan().bold())?;

        // Enclosing spans, outermost first, e.g. `execute > invoke`.
        if let Some(scope) = ctx.event_scope() {
            let names: Vec<&str> = scope.from_root().map(|span| span.name()).collect();
            if !names.is_empty() {
                write!(writer, " {}", names.join(" > ").bright_black())?;
            }
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);
        if let Some(message) = &fields.message {
            write!(writer, " {}", message.white())?;
        }
        write!(writer, "{}", render_fields(&fields.fields))?;

        writeln!(writer)
    }
}

static LOGGING: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_log() {
    LOGGING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_fmt::Subscriber::builder()
            .with_env_filter(filter)
            .event_format(CloudfnLogFormatter)
            .init();
    });
}
