//! Daemon socket round trip, staleness restarts, keep-alive routing

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use mcp_common::{should_reset_connection, McpClientError, INVALID_PARAMS};
use mcp_runtime::config::{ConfigLayer, LoadOptions, LoadedConfig};
use mcp_runtime::daemon::{DaemonClient, DaemonHost, DaemonLauncher, DaemonPaths, LaunchRequest};
use mcp_runtime::definition::{Lifecycle, ServerDefinition};
use mcp_runtime::mcp::{CallOptions, KeepAliveRuntime, McpRuntime};
use serde_json::json;

use super::support::{files_server, runtime, wait_until, FakeConnector, FakeSessionFactory};

fn browser() -> ServerDefinition {
    ServerDefinition::stdio("browser", "chrome-devtools-mcp", Vec::new())
        .with_lifecycle(Lifecycle::KeepAlive {
            idle_timeout_ms: None,
        })
}

fn search() -> ServerDefinition {
    ServerDefinition::stdio("search", "search-mcp", Vec::new()).with_lifecycle(Lifecycle::KeepAlive {
        idle_timeout_ms: None,
    })
}

fn layer(path: &str, mtime_ms: u64) -> ConfigLayer {
    ConfigLayer {
        path: PathBuf::from(path),
        mtime_ms,
    }
}

/// Starts a [`DaemonHost`] on a task of the test runtime
struct InProcessLauncher {
    connector: Arc<FakeConnector>,
    definitions: Vec<ServerDefinition>,
    layers: Arc<Mutex<Vec<ConfigLayer>>>,
    state_dir: PathBuf,
    launches: AtomicUsize,
    /// Hosts whose `run` has not returned yet
    live: Arc<AtomicUsize>,
}

impl InProcessLauncher {
    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DaemonLauncher for InProcessLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<()> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let config = LoadedConfig {
            config_path: request.options.explicit.clone().unwrap_or_default(),
            servers: self.definitions.clone(),
            layers: self.layers.lock().expect("layers lock").clone(),
        };
        let rt = runtime(
            self.definitions.clone(),
            self.connector.clone(),
            FakeSessionFactory::refusing(),
            &self.state_dir,
        );
        let host = Arc::new(DaemonHost::with_runtime(rt, &config, request.paths.clone()));
        let live = self.live.clone();
        live.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            if let Err(e) = host.run().await {
                eprintln!("daemon host failed: {e:#}");
            }
            live.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }
}

struct Harness {
    connector: Arc<FakeConnector>,
    launcher: Arc<InProcessLauncher>,
    layers: Arc<Mutex<Vec<ConfigLayer>>>,
    client: DaemonClient,
}

fn harness(dir: &Path) -> Harness {
    harness_with(dir, vec![browser()])
}

fn harness_with(dir: &Path, definitions: Vec<ServerDefinition>) -> Harness {
    let connector = FakeConnector::new();
    let layers = Arc::new(Mutex::new(vec![layer("/cfg/a.json", 100), layer("/cfg/b.json", 100)]));
    let launcher = Arc::new(InProcessLauncher {
        connector: connector.clone(),
        definitions,
        layers: layers.clone(),
        state_dir: dir.to_path_buf(),
        launches: AtomicUsize::new(0),
        live: Arc::new(AtomicUsize::new(0)),
    });
    let config_path = dir.join("mcp.json");
    let options = LoadOptions {
        explicit: Some(config_path.clone()),
        root_dir: dir.to_path_buf(),
    };
    let paths = DaemonPaths::in_dir(&dir.join("daemon"), &config_path);
    let source = layers.clone();
    let client = DaemonClient::new(options, paths, launcher.clone())
        .with_layer_source(move || source.lock().expect("layers lock").clone());
    Harness {
        connector,
        launcher,
        layers,
        client,
    }
}

#[tokio::test]
async fn test_socket_round_trip() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = harness(tmp.path());

    assert!(h.client.status().await.expect("status").is_none());
    h.client.start().await.expect("start");
    assert_eq!(h.launcher.launches(), 1);

    let status = h.client.status().await.expect("status").expect("running");
    assert_eq!(status.pid, std::process::id());
    assert_eq!(status.servers.len(), 1);
    assert!(!status.servers[0].connected);

    let result = h
        .client
        .call_tool("browser", "navigate", Some(json!({"url": "about:blank"})), None)
        .await
        .expect("call");
    assert_eq!(
        result.text().as_deref(),
        Some(r#"navigate:{"url":"about:blank"}"#)
    );

    let tools = h
        .client
        .list_tools("browser", true, false)
        .await
        .expect("tools");
    assert_eq!(tools.len(), 2);
    let resources = h
        .client
        .list_resources("browser", None)
        .await
        .expect("resources");
    assert_eq!(resources["resources"][0]["uri"], "file:///a");

    let status = h.client.status().await.expect("status").expect("running");
    assert!(status.servers[0].connected);
    assert!(status.servers[0].last_used_secs.is_some());
    assert_eq!(h.connector.spawns(), 1);

    h.client.close_server("browser").await.expect("close server");
    let status = h.client.status().await.expect("status").expect("running");
    assert!(!status.servers[0].connected);

    assert!(h.client.stop().await.expect("stop"));
    assert!(h.client.status().await.expect("status").is_none());
    assert!(!h.client.paths().socket.exists());
}

#[tokio::test]
async fn test_unknown_daemon_server_is_reported() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = harness(tmp.path());

    let err = h
        .client
        .call_tool("files", "read", None, None)
        .await
        .expect_err("not held by the daemon");
    assert!(err.to_string().contains("files"));
    h.client.stop().await.expect("stop");
}

#[tokio::test]
async fn test_unchanged_layers_reuse_daemon() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = harness(tmp.path());

    h.client
        .call_tool("browser", "a", None, None)
        .await
        .expect("first call launches");
    h.client
        .call_tool("browser", "b", None, None)
        .await
        .expect("second call");
    assert_eq!(h.launcher.launches(), 1);
    assert_eq!(h.connector.spawns(), 1);
    h.client.stop().await.expect("stop");
}

#[tokio::test]
async fn test_changed_layers_restart_daemon() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = harness(tmp.path());

    h.client
        .call_tool("browser", "a", None, None)
        .await
        .expect("first call launches");
    assert_eq!(h.launcher.launches(), 1);

    *h.layers.lock().expect("layers lock") =
        vec![layer("/cfg/a.json", 100), layer("/cfg/b.json", 200)];
    h.client
        .call_tool("browser", "b", None, None)
        .await
        .expect("call after restart");
    assert_eq!(h.launcher.launches(), 2);
    // The old daemon closed its server on the way out
    assert_eq!(h.connector.closes(), 1);
    assert_eq!(h.connector.spawns(), 2);

    h.client
        .call_tool("browser", "c", None, None)
        .await
        .expect("fresh daemon reused");
    assert_eq!(h.launcher.launches(), 2);
    h.client.stop().await.expect("stop");
}

#[tokio::test]
async fn test_unanswered_call_replaces_daemon_without_orphans() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = harness(tmp.path());
    let client = h
        .client
        .clone()
        .with_response_margin(Duration::from_millis(200));
    client.start().await.expect("start");

    h.connector.hang_calls.store(true, Ordering::SeqCst);
    let stuck = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call_tool("browser", "stuck", None, Some(Duration::from_secs(30)))
                .await
        })
    };
    assert!(wait_until(|| h.connector.logged("start:browser/stuck")).await);
    h.connector.hang_calls.store(false, Ordering::SeqCst);

    // Queued behind the stuck call, so the daemon never answers in time
    let result = client
        .call_tool("browser", "queued", None, Some(Duration::from_millis(100)))
        .await
        .expect("answered by a fresh daemon");
    assert_eq!(result.text().as_deref(), Some("queued:null"));
    assert_eq!(h.launcher.launches(), 2);
    assert!(wait_until(|| h.launcher.live() == 1).await, "old daemon still running");
    // The old daemon closed its server on the way out
    assert_eq!(h.connector.closes(), 1);

    stuck.abort();
    assert!(client.stop().await.expect("stop"));
    assert!(wait_until(|| h.launcher.live() == 0).await);
    assert!(!client.paths().socket.exists());
}

#[tokio::test]
async fn test_requests_for_one_server_run_in_arrival_order() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = harness_with(tmp.path(), vec![browser(), search()]);
    h.client.start().await.expect("start");

    let call = |server: &'static str, tool: &'static str| {
        let client = h.client.clone();
        tokio::spawn(async move { client.call_tool(server, tool, None, None).await })
    };
    let first = call("browser", "slow_first");
    assert!(wait_until(|| h.connector.logged("start:browser/slow_first")).await);
    let second = call("browser", "slow_second");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let third = call("browser", "third");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let other = call("search", "query");

    other.await.expect("join").expect("search call");
    // `search` is not held up by the busy `browser`
    assert!(!h.connector.logged("end:browser/slow_first"));

    for handle in [first, second, third] {
        handle.await.expect("join").expect("browser call");
    }
    let log = h.connector.calls();
    let browser: Vec<&str> = log
        .iter()
        .map(String::as_str)
        .filter(|entry| entry.contains("browser/"))
        .collect();
    assert_eq!(
        browser,
        [
            "start:browser/slow_first",
            "end:browser/slow_first",
            "start:browser/slow_second",
            "end:browser/slow_second",
            "start:browser/third",
            "end:browser/third",
        ]
    );
    h.client.stop().await.expect("stop");
}

fn keep_alive_runtime(h: &Harness, direct: Arc<FakeConnector>, dir: &Path) -> KeepAliveRuntime {
    let rt = runtime(
        vec![browser(), files_server()],
        direct,
        FakeSessionFactory::refusing(),
        dir,
    );
    KeepAliveRuntime::new(Arc::new(rt), Some(h.client.clone()))
}

#[tokio::test]
async fn test_keep_alive_fatal_failure_restarts_server_once() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = harness(tmp.path());
    let direct = FakeConnector::new();
    let rt = keep_alive_runtime(&h, direct.clone(), tmp.path());

    h.connector.fail_next_call(McpClientError::StdioExit {
        code: None,
        signal: Some("SIGKILL".to_string()),
    });
    let result = rt
        .call_tool("browser", "navigate", CallOptions::default())
        .await
        .expect("retried after restart");
    assert_eq!(result.text().as_deref(), Some("navigate:null"));
    assert_eq!(h.connector.spawns(), 2);
    assert_eq!(h.launcher.launches(), 1);
    assert_eq!(direct.spawns(), 0);
    h.client.stop().await.expect("stop");
}

#[tokio::test]
async fn test_keep_alive_invalid_params_is_not_fatal() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = harness(tmp.path());
    let rt = keep_alive_runtime(&h, FakeConnector::new(), tmp.path());

    h.connector.fail_next_call(McpClientError::Rpc {
        code: INVALID_PARAMS,
        message: "url is required".to_string(),
    });
    let err = rt
        .call_tool("browser", "navigate", CallOptions::default())
        .await
        .expect_err("invalid params");
    assert!(err.to_string().contains("url is required"));
    assert!(!should_reset_connection(&err));
    assert_eq!(h.connector.spawns(), 1);
    assert_eq!(h.connector.closes(), 0);
    assert_eq!(h.launcher.launches(), 1);
    h.client.stop().await.expect("stop");
}

#[tokio::test]
async fn test_ephemeral_servers_bypass_daemon() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = harness(tmp.path());
    let direct = FakeConnector::new();
    let rt = keep_alive_runtime(&h, direct.clone(), tmp.path());

    rt.call_tool("files", "read", CallOptions::default())
        .await
        .expect("direct call");
    assert_eq!(direct.spawns(), 1);
    assert_eq!(h.launcher.launches(), 0);
    rt.close(None).await.expect("close");
    assert_eq!(direct.closes(), 1);
}

#[tokio::test]
async fn test_closing_keep_alive_server_closes_it_in_daemon() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = harness(tmp.path());
    let direct = FakeConnector::new();
    let rt = keep_alive_runtime(&h, direct.clone(), tmp.path());

    rt.call_tool("browser", "navigate", CallOptions::default())
        .await
        .expect("daemon call");
    let status = h.client.status().await.expect("status").expect("running");
    assert!(status.servers[0].connected);

    rt.close(Some("browser")).await.expect("close");
    let status = h.client.status().await.expect("status").expect("running");
    assert!(!status.servers[0].connected);
    assert_eq!(h.connector.closes(), 1);
    assert_eq!(direct.closes(), 0);

    // Closing everything leaves the daemon's servers alone
    rt.call_tool("browser", "navigate", CallOptions::default())
        .await
        .expect("reconnected");
    rt.close(None).await.expect("close all");
    let status = h.client.status().await.expect("status").expect("running");
    assert!(status.servers[0].connected);
    h.client.stop().await.expect("stop");
}

#[tokio::test]
async fn test_closing_keep_alive_server_without_daemon_is_a_no_op() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = harness(tmp.path());
    let rt = keep_alive_runtime(&h, FakeConnector::new(), tmp.path());

    rt.close(Some("browser")).await.expect("nothing to close");
    assert_eq!(h.launcher.launches(), 0);
}
