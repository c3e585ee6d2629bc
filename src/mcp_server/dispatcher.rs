//! Request dispatcher: matches a call to its handler and isolates faults.
//!
//! A handler that returns an error or panics produces an `isError` result;
//! nothing a handler does can take down the serve loop or corrupt the
//! transport. Calls run one at a time, in arrival order.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use serde_json::Value;

use super::registry::ToolRegistry;
use crate::protocol::types::{ListToolsResult, ToolCallRequest, ToolCallResult};

/// Routes `tools/list` and `tools/call` against a fixed registry.
#[derive(Debug)]
pub struct Dispatcher {
    registry: ToolRegistry,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Discovery response: every registered tool, once.
    pub fn list_tools(&self) -> ListToolsResult {
        ListToolsResult {
            tools: self.registry.definitions(),
        }
    }

    /// Execute one call. Always yields a result; never an `Err`.
    pub async fn dispatch(&self, request: &ToolCallRequest) -> ToolCallResult {
        let name = request.tool_name.as_str();

        let Some(handler) = self.registry.handler(name) else {
            tracing::warn!(tool = %name, request_id = %request.id, "call for unknown tool");
            return ToolCallResult::error_text(format!("Unknown tool: {name}"));
        };

        let arguments = match &request.arguments {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other.clone(),
        };

        let start = Instant::now();
        // The handler is invoked inside the guarded future so a panic while
        // building its future is caught too.
        let outcome = AssertUnwindSafe(async move { handler(arguments).await })
            .catch_unwind()
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(content)) => {
                tracing::debug!(tool = %name, request_id = %request.id, elapsed_ms, "tool call succeeded");
                ToolCallResult::success(content)
            }
            Ok(Err(fault)) => {
                tracing::error!(tool = %name, request_id = %request.id, error = %fault, "tool handler failed");
                ToolCallResult::error_text(format!("Error executing {name}: {fault}"))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(tool = %name, request_id = %request.id, panic = %message, "tool handler panicked");
                ToolCallResult::error_text(format!("Error executing {name}: {message}"))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_server::registry::{HandlerResult, ToolFault};
    use crate::protocol::types::{ContentBlock, RequestId, ToolDefinition};

    fn def(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: String::new(),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    fn call(name: &str, arguments: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: RequestId::Number(1),
            tool_name: name.to_string(),
            arguments,
        }
    }

    async fn greet(args: Value) -> HandlerResult {
        let who = args.get("who").and_then(Value::as_str).unwrap_or("world");
        Ok(vec![ContentBlock::text(format!("hello {who}"))])
    }

    async fn fails(_args: Value) -> HandlerResult {
        Err(ToolFault::new("disk on fire"))
    }

    async fn panics(_args: Value) -> HandlerResult {
        panic!("boom")
    }

    async fn echo_args(args: Value) -> HandlerResult {
        Ok(vec![ContentBlock::text(args.to_string())])
    }

    fn dispatcher() -> Dispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(def("ok"), greet).unwrap();
        registry.register(def("fails"), fails).unwrap();
        registry.register(def("panics"), panics).unwrap();
        registry.register(def("args"), echo_args).unwrap();
        Dispatcher::new(registry)
    }

    #[test]
    fn test_list_tools_returns_each_tool_once() {
        let d = dispatcher();
        let names: Vec<String> = d.list_tools().tools.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["ok", "fails", "panics", "args"]);
    }

    #[tokio::test]
    async fn test_success() {
        let d = dispatcher();
        let result = d.dispatch(&call("ok", serde_json::json!({"who": "there"}))).await;
        assert!(!result.is_error);
        assert_eq!(result.text(), "hello there");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let d = dispatcher();
        let result = d.dispatch(&call("missing_tool", Value::Null)).await;
        assert!(result.is_error);
        assert!(result.text().contains("missing_tool"));
    }

    #[tokio::test]
    async fn test_handler_error_is_isolated() {
        let d = dispatcher();
        let result = d.dispatch(&call("fails", Value::Null)).await;
        assert!(result.is_error);
        assert_eq!(result.text(), "Error executing fails: disk on fire");

        let after = d.dispatch(&call("ok", Value::Null)).await;
        assert!(!after.is_error);
    }

    #[tokio::test]
    async fn test_handler_panic_is_isolated() {
        let d = dispatcher();
        let result = d.dispatch(&call("panics", Value::Null)).await;
        assert!(result.is_error);
        assert!(result.text().contains("boom"));

        let after = d.dispatch(&call("ok", Value::Null)).await;
        assert_eq!(after.text(), "hello world");
    }

    #[tokio::test]
    async fn test_null_arguments_become_empty_object() {
        let d = dispatcher();
        let result = d.dispatch(&call("args", Value::Null)).await;
        assert_eq!(result.text(), "{}");
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "handler panicked");
    }
}
