//! Merged tool catalog: one view over every ready server's tools.
//!
//! Provides:
//! - Tool lookup by exact name, with the owning server
//! - First-registered-wins resolution of duplicate names
//! - Structural argument checks against a tool's `inputSchema`
//! - Serialization of tools for a language-model prompt or function list

use std::collections::HashMap;

use serde_json::Value;

use super::errors::McpError;
use crate::protocol::types::ToolDefinition;

// ─── MergedCatalog ───────────────────────────────────────────────────────────

/// A visible tool and the server that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub server: String,
    pub tool: ToolDefinition,
}

/// A tool hidden behind an earlier server's tool of the same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowedTool {
    pub name: String,
    /// Server whose copy is hidden.
    pub server: String,
    /// Server whose copy is visible.
    pub owner: String,
}

/// Tools from many servers, in registration order, one entry per name.
#[derive(Debug, Clone, Default)]
pub struct MergedCatalog {
    entries: Vec<CatalogEntry>,
    /// `tool_name → index into entries`.
    index: HashMap<String, usize>,
    shadowed: Vec<ShadowedTool>,
}

impl MergedCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server's tools after everything already registered.
    ///
    /// A name that is already visible keeps its first owner; the later copy
    /// is recorded as shadowed.
    pub fn register_server_tools(&mut self, server_name: &str, tools: Vec<ToolDefinition>) {
        for tool in tools {
            if let Some(&i) = self.index.get(&tool.name) {
                let owner = self.entries[i].server.clone();
                tracing::warn!(
                    tool = %tool.name,
                    server = %server_name,
                    owner = %owner,
                    "duplicate tool name, keeping the first registration"
                );
                self.shadowed.push(ShadowedTool {
                    name: tool.name,
                    server: server_name.to_string(),
                    owner,
                });
                continue;
            }

            self.index.insert(tool.name.clone(), self.entries.len());
            self.entries.push(CatalogEntry {
                server: server_name.to_string(),
                tool,
            });
        }
    }

    /// Look up a tool by name.
    pub fn get_tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.entry(name).map(|e| &e.tool)
    }

    /// Get the server name that owns a tool.
    pub fn get_server_for_tool(&self, tool_name: &str) -> Option<&str> {
        self.entry(tool_name).map(|e| e.server.as_str())
    }

    pub fn entry(&self, name: &str) -> Option<&CatalogEntry> {
        self.index.get(name).and_then(|&i| self.entries.get(i))
    }

    /// Visible entries in catalog order.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Visible tool definitions in catalog order.
    pub fn all_tools(&self) -> Vec<ToolDefinition> {
        self.entries.iter().map(|e| e.tool.clone()).collect()
    }

    /// Return all visible tool names.
    pub fn tool_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.tool.name.as_str()).collect()
    }

    /// Tools hidden by first-registered-wins.
    pub fn shadowed(&self) -> &[ShadowedTool] {
        &self.shadowed
    }

    /// Number of visible tools.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count visible tools belonging to a specific server.
    pub fn tools_for_server(&self, server_name: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.server == server_name)
            .count()
    }

    /// Servers contributing at least one visible tool, in registration order.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for entry in &self.entries {
            if !names.contains(&entry.server) {
                names.push(entry.server.clone());
            }
        }
        names
    }

    /// Validate a call against a visible tool's schema.
    ///
    /// Unknown names pass; routing reports them separately.
    pub fn validate_tool_call(&self, tool_name: &str, arguments: &Value) -> Result<(), McpError> {
        match self.get_tool(tool_name) {
            Some(def) => validate_arguments(def, arguments),
            None => Ok(()),
        }
    }

    /// Generate a concise capability summary for a system prompt.
    ///
    /// One line with totals, then one line per server listing its tools.
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No MCP tools currently available.".to_string();
        }

        let server_names = self.server_names();
        let server_parts: Vec<String> = server_names
            .iter()
            .map(|name| format!("{name} ({})", self.tools_for_server(name)))
            .collect();

        let mut summary = format!(
            "Available capabilities ({} tools across {} servers): {}.",
            self.len(),
            server_names.len(),
            server_parts.join(", "),
        );

        for name in &server_names {
            let tools: Vec<&str> = self
                .entries
                .iter()
                .filter(|e| &e.server == name)
                .map(|e| e.tool.name.as_str())
                .collect();
            summary.push_str(&format!("\n{name}: {}.", tools.join(", ")));
        }

        summary
    }

    /// Serialize all visible tools into OpenAI function-calling format.
    pub fn to_openai_tools(&self) -> Vec<Value> {
        self.entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": e.tool.name,
                        "description": e.tool.description,
                        "parameters": e.tool.input_schema,
                    }
                })
            })
            .collect()
    }
}

// ─── Argument Validation ─────────────────────────────────────────────────────

/// Structural check of `arguments` against `tool.input_schema`.
///
/// Arguments must be an object (or null, meaning empty), and every field the
/// schema lists as `required` must be present. Full JSON Schema validation
/// is left to the server.
pub fn validate_arguments(tool: &ToolDefinition, arguments: &Value) -> Result<(), McpError> {
    let args_obj = match arguments {
        Value::Object(obj) => Some(obj),
        Value::Null => None,
        other => {
            return Err(McpError::InvalidArguments {
                tool: tool.name.clone(),
                reason: format!("arguments must be an object, got {}", json_type(other)),
            })
        }
    };

    let Some(required) = tool.input_schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };

    for field_name in required.iter().filter_map(Value::as_str) {
        let has_field = args_obj
            .map(|obj| obj.contains_key(field_name))
            .unwrap_or(false);
        if !has_field {
            return Err(McpError::InvalidArguments {
                tool: tool.name.clone(),
                reason: format!("missing required field: '{field_name}'"),
            });
        }
    }

    Ok(())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
