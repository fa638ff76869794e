//! Connection caching, close, and eviction

use std::sync::atomic::Ordering;
use std::time::Duration;

use mcp_common::{analyze_connection_error, IssueKind, McpClientError, INVALID_PARAMS};
use mcp_runtime::mcp::{CallOptions, ListToolsOptions, McpRuntime};
use serde_json::json;

use super::support::{files_server, runtime, FakeConnector, FakeSessionFactory};

#[tokio::test]
async fn test_files_server_spawns_reuses_and_respawns_after_close() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let connector = FakeConnector::new();
    let rt = runtime(
        vec![files_server()],
        connector.clone(),
        FakeSessionFactory::refusing(),
        tmp.path(),
    );

    let tools = rt
        .list_tools("files", ListToolsOptions::default())
        .await
        .expect("first list");
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["read", "write"]);
    assert!(tools[0].input_schema.is_some());
    assert_eq!(connector.spawns(), 1);

    rt.list_tools("files", ListToolsOptions::default())
        .await
        .expect("second list");
    assert_eq!(connector.spawns(), 1);

    rt.close(Some("files")).await.expect("close");
    assert_eq!(connector.closes(), 1);

    rt.list_tools("files", ListToolsOptions::default())
        .await
        .expect("third list");
    assert_eq!(connector.spawns(), 2);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let connector = FakeConnector::new();
    let rt = runtime(
        vec![files_server()],
        connector.clone(),
        FakeSessionFactory::refusing(),
        tmp.path(),
    );

    rt.close(Some("files")).await.expect("close before connect");
    rt.list_tools("files", ListToolsOptions::default())
        .await
        .expect("list");
    rt.close(None).await.expect("close all");
    rt.close(None).await.expect("close all again");
    rt.close(Some("files")).await.expect("close one again");
    assert_eq!(connector.closes(), 1);
    assert!(rt.connected_servers().await.is_empty());
}

#[tokio::test]
async fn test_schemas_dropped_on_request() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let rt = runtime(
        vec![files_server()],
        FakeConnector::new(),
        FakeSessionFactory::refusing(),
        tmp.path(),
    );
    let tools = rt
        .list_tools(
            "files",
            ListToolsOptions {
                include_schema: false,
                auto_authorize: true,
            },
        )
        .await
        .expect("list");
    assert!(tools.iter().all(|t| t.input_schema.is_none()));
}

#[tokio::test]
async fn test_stdio_exit_evicts_connection() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let connector = FakeConnector::new();
    let rt = runtime(
        vec![files_server()],
        connector.clone(),
        FakeSessionFactory::refusing(),
        tmp.path(),
    );

    connector.fail_next_call(McpClientError::StdioExit {
        code: Some(1),
        signal: None,
    });
    let err = rt
        .call_tool("files", "read", CallOptions::default())
        .await
        .expect_err("exit");
    assert_eq!(analyze_connection_error(&err).kind, IssueKind::StdioExit);
    assert_eq!(connector.closes(), 1);

    let result = rt
        .call_tool("files", "read", CallOptions::with_arguments(json!({"path": "a"})))
        .await
        .expect("fresh connection");
    assert_eq!(result.text().as_deref(), Some(r#"read:{"path":"a"}"#));
    assert_eq!(connector.spawns(), 2);
}

#[tokio::test]
async fn test_offline_evicts_connection() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let connector = FakeConnector::new();
    let rt = runtime(
        vec![files_server()],
        connector.clone(),
        FakeSessionFactory::refusing(),
        tmp.path(),
    );

    connector.fail_next_call(McpClientError::Network("connection reset by peer".to_string()));
    let err = rt
        .call_tool("files", "read", CallOptions::default())
        .await
        .expect_err("offline");
    assert_eq!(analyze_connection_error(&err).kind, IssueKind::Offline);

    rt.call_tool("files", "read", CallOptions::default())
        .await
        .expect("reconnected");
    assert_eq!(connector.spawns(), 2);
}

#[tokio::test]
async fn test_invalid_params_keeps_connection() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let connector = FakeConnector::new();
    let rt = runtime(
        vec![files_server()],
        connector.clone(),
        FakeSessionFactory::refusing(),
        tmp.path(),
    );

    connector.fail_next_call(McpClientError::Rpc {
        code: INVALID_PARAMS,
        message: "path is required".to_string(),
    });
    rt.call_tool("files", "read", CallOptions::default())
        .await
        .expect_err("invalid params");

    rt.call_tool("files", "read", CallOptions::default())
        .await
        .expect("same connection");
    assert_eq!(connector.spawns(), 1);
    assert_eq!(connector.closes(), 0);
}

#[tokio::test]
async fn test_call_timeout_names_server_tool_and_evicts() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let connector = FakeConnector::new();
    let rt = runtime(
        vec![files_server()],
        connector.clone(),
        FakeSessionFactory::refusing(),
        tmp.path(),
    );

    connector.hang_calls.store(true, Ordering::SeqCst);
    let err = rt
        .call_tool(
            "files",
            "read",
            CallOptions {
                arguments: None,
                timeout: Some(Duration::from_millis(50)),
            },
        )
        .await
        .expect_err("timeout");
    let message = err.to_string();
    assert!(message.contains("files.read"), "{message}");
    assert!(message.contains("50ms"), "{message}");
    assert_eq!(connector.closes(), 1);
    assert!(rt.connected_servers().await.is_empty());
}

#[tokio::test]
async fn test_unknown_server() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let connector = FakeConnector::new();
    let rt = runtime(
        vec![files_server()],
        connector.clone(),
        FakeSessionFactory::refusing(),
        tmp.path(),
    );
    let err = rt
        .list_resources("nope", None)
        .await
        .expect_err("unknown");
    assert!(err.to_string().contains("nope"));
    assert_eq!(connector.spawns(), 0);

    let resources = rt.list_resources("files", None).await.expect("resources");
    assert_eq!(resources["resources"][0]["name"], "a");
}
