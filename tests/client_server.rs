//! End-to-end tests: a connector driving in-process tool servers over
//! in-memory pipes.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use toolbridge::mcp_client::{ConnectorSettings, McpClient, McpError};
use toolbridge::mcp_server::time_tools::time_server;
use toolbridge::mcp_server::{Dispatcher, HandlerResult, ServerHost, ToolFault, ToolRegistry};
use toolbridge::protocol::session::SessionState;
use toolbridge::protocol::types::{ContentBlock, Implementation, ToolDefinition};

fn settings() -> ConnectorSettings {
    ConnectorSettings {
        call_timeout_ms: 2_000,
        init_timeout_ms: 2_000,
        shutdown_grace_ms: 200,
    }
}

/// Wire `host` to the client under `name` over a pair of duplex pipes.
async fn connect(client: &McpClient, name: &str, host: ServerHost) -> Result<(), McpError> {
    let (client_out, server_in) = tokio::io::duplex(64 * 1024);
    let (server_out, client_in) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move { host.serve(server_in, server_out).await });
    client.add_connection(name, client_in, client_out).await
}

fn object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// A server with a tool that never finishes and a tool that always faults.
fn misbehaving_server() -> ServerHost {
    let mut registry = ToolRegistry::new();
    registry
        .register(
            ToolDefinition {
                name: "sleep_forever".into(),
                description: "Never returns".into(),
                input_schema: object_schema(),
            },
            |_args: Value| async move {
                std::future::pending::<()>().await;
                HandlerResult::Ok(vec![])
            },
        )
        .unwrap();
    registry
        .register(
            ToolDefinition {
                name: "always_fails".into(),
                description: "Reports a fault".into(),
                input_schema: object_schema(),
            },
            |_args: Value| async move { HandlerResult::Err(ToolFault::new("disk on fire")) },
        )
        .unwrap();
    registry
        .register(
            ToolDefinition {
                name: "echo".into(),
                description: "Echo the arguments back".into(),
                input_schema: object_schema(),
            },
            |args: Value| async move { HandlerResult::Ok(vec![ContentBlock::text(args.to_string())]) },
        )
        .unwrap();

    let info = Implementation {
        name: "misbehaving".into(),
        version: "0.0.1".into(),
    };
    ServerHost::new(info, Dispatcher::new(registry))
}

#[tokio::test]
async fn test_discovers_time_tools_with_schemas() {
    let client = McpClient::new(settings());
    connect(&client, "time", time_server().unwrap()).await.unwrap();

    let tools = client.list_tools();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["get_current_time", "get_current_time_formatted", "get_timestamp"]
    );
    for tool in &tools {
        assert_eq!(tool.input_schema["type"], "object");
        assert!(!tool.description.is_empty());
    }
    assert!(client.is_server_ready("time"));
}

#[tokio::test]
async fn test_current_time_is_iso8601() {
    let client = McpClient::new(settings());
    connect(&client, "time", time_server().unwrap()).await.unwrap();

    let result = client.invoke("get_current_time", json!({})).await.unwrap();
    assert!(!result.is_error);
    let text = result.text();
    let iso = text.trim_start_matches("Current time: ");
    assert!(DateTime::parse_from_rfc3339(iso).is_ok(), "not ISO 8601: {text}");
}

#[tokio::test]
async fn test_timestamp_in_seconds_is_close_to_now() {
    let client = McpClient::new(settings());
    connect(&client, "time", time_server().unwrap()).await.unwrap();

    let result = client
        .invoke("get_timestamp", json!({"format": "seconds"}))
        .await
        .unwrap();
    assert!(!result.is_error);

    let text = result.text();
    let value: i64 = text
        .rsplit(' ')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("no timestamp in {text:?}"));
    assert!((value - Utc::now().timestamp()).abs() <= 5);
}

#[tokio::test]
async fn test_unknown_tool_is_error_result() {
    let client = McpClient::new(settings());
    connect(&client, "time", time_server().unwrap()).await.unwrap();

    let result = client.invoke("get_weather", json!({})).await.unwrap();
    assert!(result.is_error);
    assert!(result.text().contains("get_weather"));
    assert!(client.is_server_ready("time"));
}

#[tokio::test]
async fn test_handler_fault_does_not_break_connection() {
    let client = McpClient::new(settings());
    connect(&client, "bad", misbehaving_server()).await.unwrap();

    let result = client.invoke("always_fails", json!({})).await.unwrap();
    assert!(result.is_error);
    assert!(result.text().contains("disk on fire"));

    let result = client.invoke("echo", json!({"n": 7})).await.unwrap();
    assert!(!result.is_error);
    assert_eq!(result.text(), r#"{"n":7}"#);
    assert_eq!(client.connection_state("bad"), Some(SessionState::Ready));
}

#[tokio::test]
async fn test_slow_server_does_not_block_other_server() {
    let client = McpClient::new(settings());
    connect(&client, "slow", misbehaving_server()).await.unwrap();
    connect(&client, "time", time_server().unwrap()).await.unwrap();

    let limit = Duration::from_millis(300);
    let start = Instant::now();
    let (slow, fast) = tokio::join!(
        client.invoke_with_timeout("sleep_forever", json!({}), limit),
        client.invoke_with_timeout("get_current_time", json!({}), limit),
    );

    match slow {
        Err(McpError::Timeout { tool, timeout_ms }) => {
            assert_eq!(tool, "sleep_forever");
            assert_eq!(timeout_ms, 300);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(!fast.unwrap().is_error);
    assert!(start.elapsed() < Duration::from_secs(2));

    // A timeout fails only that call.
    assert_eq!(client.connection_state("slow"), Some(SessionState::Ready));
}

#[tokio::test]
async fn test_concurrent_calls_on_one_connection() {
    let client = McpClient::new(settings());
    connect(&client, "time", time_server().unwrap()).await.unwrap();

    let calls = (0..8).map(|i| {
        let tool = if i % 2 == 0 { "get_timestamp" } else { "get_current_time" };
        client.invoke(tool, json!({}))
    });
    let results = futures::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        let text = result.unwrap().text();
        if i % 2 == 0 {
            assert!(text.starts_with("Current timestamp"), "{text}");
        } else {
            assert!(text.starts_with("Current time:"), "{text}");
        }
    }
}

#[tokio::test]
async fn test_remove_server_fails_pending_call() {
    let client = std::sync::Arc::new(McpClient::new(settings()));
    connect(&client, "slow", misbehaving_server()).await.unwrap();

    let caller = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .invoke_with_timeout("sleep_forever", json!({}), Duration::from_secs(30))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    client.remove_server("slow").await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));

    let outcome = caller.await.unwrap();
    assert!(
        matches!(outcome, Err(McpError::ConnectionClosed { .. })),
        "unexpected outcome: {outcome:?}"
    );
    assert!(client.server_names().is_empty());
    assert!(client.list_tools().is_empty());
}

#[tokio::test]
async fn test_first_registered_server_owns_shared_names() {
    let client = McpClient::new(settings());
    connect(&client, "alpha", time_server().unwrap()).await.unwrap();
    connect(&client, "beta", time_server().unwrap()).await.unwrap();

    let catalog = client.catalog();
    assert_eq!(catalog.len(), 3);
    for name in catalog.tool_names() {
        assert_eq!(catalog.get_server_for_tool(name), Some("alpha"));
    }
    let summary = client.capability_summary();
    assert!(summary.contains("3 tools across 1 servers"), "{summary}");
}

#[tokio::test]
async fn test_server_exits_when_client_shuts_down() {
    let client = McpClient::new(settings());
    let host = time_server().unwrap();
    let (client_out, server_in) = tokio::io::duplex(64 * 1024);
    let (server_out, client_in) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move { host.serve(server_in, server_out).await });
    client
        .add_connection("time", client_in, client_out)
        .await
        .unwrap();

    client.shutdown_all().await;

    let reason = tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(reason, toolbridge::mcp_server::ShutdownReason::InputClosed);
}
