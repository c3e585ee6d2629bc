//! Reference tool set: wall-clock time queries.
//!
//! Exposes `get_current_time`, `get_current_time_formatted` and
//! `get_timestamp`. Used by the `time-server` binary and by tests that need
//! a real server on the other end of a connection.

use chrono::{DateTime, FixedOffset, Local, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};

use super::dispatcher::Dispatcher;
use super::host::ServerHost;
use super::registry::{HandlerResult, RegistryError, ToolFault, ToolRegistry};
use crate::protocol::types::{ContentBlock, Implementation, ToolDefinition};

/// Server name announced in `serverInfo`.
pub const SERVER_NAME: &str = "time-server";

/// Build the registry holding the three time tools.
pub fn time_tools() -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();

    registry.register(
        ToolDefinition {
            name: "get_current_time".to_string(),
            description: "Get the current date and time in ISO format".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": [],
            }),
        },
        |_args: Value| async move { current_time(Utc::now()) },
    )?;

    registry.register(
        ToolDefinition {
            name: "get_current_time_formatted".to_string(),
            description: "Get the current date and time in a human-readable format".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "timezone": {
                        "type": "string",
                        "description": "Timezone for the formatted time (e.g., \"America/New_York\", \"Europe/London\")",
                        "default": "local",
                    },
                    "format": {
                        "type": "string",
                        "description": "Format style: \"short\", \"medium\", \"long\", or \"full\"",
                        "default": "medium",
                    },
                },
                "required": [],
            }),
        },
        |args: Value| async move { current_time_formatted(Utc::now(), &args) },
    )?;

    registry.register(
        ToolDefinition {
            name: "get_timestamp".to_string(),
            description: "Get the current Unix timestamp".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "format": {
                        "type": "string",
                        "description": "Timestamp format: \"seconds\" or \"milliseconds\"; any other value is rejected",
                        "default": "milliseconds",
                    },
                },
                "required": [],
            }),
        },
        |args: Value| async move { timestamp(Utc::now(), &args) },
    )?;

    Ok(registry)
}

/// A ready-to-serve host for the time tools.
pub fn time_server() -> Result<ServerHost, RegistryError> {
    let info = Implementation {
        name: SERVER_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    Ok(ServerHost::new(info, Dispatcher::new(time_tools()?)))
}

// ─── Handlers ────────────────────────────────────────────────────────────────

fn current_time(now: DateTime<Utc>) -> HandlerResult {
    let iso = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    Ok(vec![ContentBlock::text(format!("Current time: {iso}"))])
}

fn current_time_formatted(now: DateTime<Utc>, args: &Value) -> HandlerResult {
    let timezone = string_arg(args, "timezone")?.unwrap_or("local");
    let style = string_arg(args, "format")?.unwrap_or("medium");

    let formatted = match resolve_timezone(now, timezone) {
        Some(local) => local.format(style_pattern(style)).to_string(),
        // Unrecognised zone names fall back to the host's local time.
        None => now.with_timezone(&Local).to_rfc2822(),
    };

    Ok(vec![ContentBlock::text(format!(
        "Current time ({timezone}, {style}): {formatted}"
    ))])
}

fn timestamp(now: DateTime<Utc>, args: &Value) -> HandlerResult {
    let unit = string_arg(args, "format")?.unwrap_or("milliseconds");
    let value = match unit {
        "seconds" => now.timestamp(),
        "milliseconds" => now.timestamp_millis(),
        other => {
            return Err(ToolFault::invalid_argument(
                "format",
                format!("expected \"seconds\" or \"milliseconds\", got \"{other}\""),
            ))
        }
    };
    Ok(vec![ContentBlock::text(format!(
        "Current timestamp ({unit}): {value}"
    ))])
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Optional string argument. Present-but-not-a-string is a fault.
fn string_arg<'a>(args: &'a Value, name: &str) -> Result<Option<&'a str>, ToolFault> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(ToolFault::invalid_argument(
            name,
            format!("expected a string, got {other}"),
        )),
    }
}

fn resolve_timezone(now: DateTime<Utc>, timezone: &str) -> Option<DateTime<FixedOffset>> {
    match timezone {
        "local" => Some(now.with_timezone(&Local).into()),
        "UTC" | "utc" | "Z" => Some(now.into()),
        other => match other.parse::<FixedOffset>() {
            Ok(offset) => Some(now.with_timezone(&offset)),
            Err(_) => other
                .parse::<Tz>()
                .ok()
                .map(|zone| now.with_timezone(&zone).fixed_offset()),
        },
    }
}

fn style_pattern(style: &str) -> &'static str {
    match style {
        "short" => "%-m/%-d/%Y, %I:%M %p",
        "long" => "%B %-d, %Y at %I:%M:%S %p UTC%:z",
        "full" => "%A, %B %-d, %Y at %I:%M:%S %p UTC%:z",
        _ => "%b %-d, %Y, %I:%M %p",
    }
}
