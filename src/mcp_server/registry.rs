//! Tool registry for one server process.
//!
//! Holds each tool's published definition together with its handler. The
//! set is fixed once the server starts serving; discovery returns it in
//! registration order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::types::{ContentBlock, ToolDefinition};

/// What a handler produces: content blocks, or a fault description.
pub type HandlerResult = Result<Vec<ContentBlock>, ToolFault>;

/// Type-erased async tool handler. Receives the call's `arguments` object.
pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// A failure reported by a tool handler.
///
/// The dispatcher turns it into an `isError` result; it never reaches the
/// transport as a protocol error.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ToolFault {
    message: String,
}

impl ToolFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// An argument was present but unusable.
    pub fn invalid_argument(name: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(format!("invalid argument '{name}': {reason}"))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for ToolFault {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// Errors raised while building a registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("tool '{name}' is already registered")]
    DuplicateTool { name: String },

    #[error("tool name must not be empty")]
    EmptyName,
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: ToolHandler,
}

/// Name-keyed table of tools and their handlers.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names must be unique and non-empty.
    pub fn register<F, Fut>(
        &mut self,
        definition: ToolDefinition,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if definition.name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.index.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateTool {
                name: definition.name,
            });
        }

        let handler: ToolHandler = Arc::new(move |args: Value| handler(args).boxed());
        self.index.insert(definition.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool {
            definition,
            handler,
        });
        Ok(())
    }

    /// The full catalog, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    /// Exact-name handler lookup.
    pub fn handler(&self, name: &str) -> Option<ToolHandler> {
        self.index
            .get(name)
            .and_then(|&i| self.tools.get(i))
            .map(|t| t.handler.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.definition.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
