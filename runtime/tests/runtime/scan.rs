//! Listing every configured server without interaction

use mcp_common::IssueKind;
use mcp_runtime::definition::ServerDefinition;
use mcp_runtime::oauth::{CredentialStore, OAuthTokens};
use serde_json::json;

use super::support::{files_server, runtime, FakeConnector, FakeSessionFactory};

fn linear() -> ServerDefinition {
    ServerDefinition::http("linear", "https://mcp.linear.example/mcp")
}

fn broken() -> ServerDefinition {
    ServerDefinition::stdio("broken", "does-not-exist-mcp", Vec::new())
}

#[tokio::test]
async fn test_scan_reports_each_server_with_hints() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let connector = FakeConnector::new();
    connector
        .missing_commands
        .lock()
        .expect("missing lock")
        .push("broken".to_string());
    let sessions = FakeSessionFactory::granting();
    let rt = runtime(
        vec![files_server(), broken(), linear()],
        connector.clone(),
        sessions.clone(),
        tmp.path(),
    );

    let listings = rt.list_all_tools().await;
    assert_eq!(listings.len(), 3);
    let by_name = |name: &str| {
        listings
            .iter()
            .find(|l| l.server == name)
            .unwrap_or_else(|| panic!("missing listing for {name}"))
    };

    let files = by_name("files");
    assert_eq!(files.tools.as_ref().map(Vec::len), Some(2));
    assert!(files.issue.is_none());
    assert!(files.tools.iter().flatten().all(|t| t.input_schema.is_none()));

    let broken = by_name("broken");
    assert!(broken.tools.is_none());
    assert_eq!(broken.issue.as_ref().map(|i| i.kind), Some(IssueKind::Offline));
    assert!(broken.hint.as_deref().unwrap_or("").contains("offline"));

    let linear = by_name("linear");
    assert_eq!(linear.issue.as_ref().map(|i| i.kind), Some(IssueKind::Auth));
    assert!(linear
        .hint
        .as_deref()
        .unwrap_or("")
        .contains("mcprt auth linear"));

    assert_eq!(sessions.created(), 0);
    // Scans do not leave connections behind
    assert!(rt.connected_servers().await.is_empty());
    assert_eq!(connector.closes(), 1);
}

#[tokio::test]
async fn test_scan_uses_cached_token() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let tokens: OAuthTokens =
        serde_json::from_value(json!({"access_token": "cached-token"})).expect("tokens");
    CredentialStore::for_definition(&linear(), tmp.path())
        .save_tokens(&tokens)
        .await
        .expect("seed vault");

    let connector = FakeConnector::new();
    let sessions = FakeSessionFactory::granting();
    let rt = runtime(vec![linear()], connector.clone(), sessions.clone(), tmp.path());

    let listings = rt.list_all_tools().await;
    assert_eq!(listings[0].tools.as_ref().map(Vec::len), Some(2));
    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].bearer.as_deref(), Some("cached-token"));
    assert_eq!(sessions.created(), 0);
}
