//! HTTP negotiation: promotion to OAuth, bounded retries, terminal timeouts

use mcp_common::{is_auth_error, is_oauth_timeout};
use mcp_runtime::definition::{AuthMode, ServerDefinition};
use mcp_runtime::mcp::{
    ConnectOptions, HttpMode, ListToolsOptions, McpRuntime, Runtime, RuntimeOptions,
};

use super::support::{options, runtime, FakeConnector, FakeSessionFactory};

fn linear() -> ServerDefinition {
    ServerDefinition::http("linear", "https://mcp.linear.example/mcp")
}

#[tokio::test]
async fn test_unauthenticated_server_is_promoted_after_401() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let connector = FakeConnector::new();
    let sessions = FakeSessionFactory::granting();
    let rt = runtime(vec![linear()], connector.clone(), sessions.clone(), tmp.path());

    let context = rt
        .connect("linear", ConnectOptions::default())
        .await
        .expect("connected after consent");
    assert_eq!(context.definition().auth, AuthMode::OAuth);
    let shown = format!("{context:?}");
    assert!(shown.contains("linear") && shown.contains("has_session: true"));
    // The configured definition is untouched
    assert_eq!(rt.definition("linear").expect("def").auth, AuthMode::None);

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.mode == HttpMode::Streamable));
    assert_eq!(attempts[0].auth, AuthMode::None);
    assert_eq!(attempts[2].bearer.as_deref(), Some("granted"));
    assert_eq!(sessions.created(), 1);
    assert_eq!(sessions.begins(), 1);
}

#[tokio::test]
async fn test_promotion_is_bounded_by_max_attempts() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let connector = FakeConnector::new();
    let sessions = FakeSessionFactory::refusing();
    let rt = runtime(vec![linear()], connector.clone(), sessions.clone(), tmp.path());

    let err = rt
        .list_tools("linear", ListToolsOptions::default())
        .await
        .expect_err("never authorized");
    assert!(is_auth_error(&err));

    // Unauthenticated try, then two with the session and a single consent
    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.mode == HttpMode::Streamable));
    assert_eq!(sessions.created(), 1);
    assert_eq!(sessions.begins(), 1);
}

#[tokio::test]
async fn test_attempt_budget_is_shared_across_transports() {
    for max_attempts in [1, 2, 3, 5] {
        let tmp = tempfile::tempdir().expect("tempdir");
        let connector = FakeConnector::new();
        let sessions = FakeSessionFactory::refusing();
        let rt = Runtime::new(vec![linear()])
            .with_connector(connector.clone())
            .with_session_factory(sessions.clone())
            .with_options(RuntimeOptions {
                max_attempts,
                ..options(tmp.path())
            });

        let err = rt
            .connect("linear", ConnectOptions::default())
            .await
            .expect_err("never authorized");
        assert!(is_auth_error(&err));

        let attempts = connector.attempts();
        assert!(
            attempts.len() <= max_attempts,
            "{} connects with max_attempts={}",
            attempts.len(),
            max_attempts
        );
        assert!(sessions.created() <= 1);
        // Consent only ever runs between two streamable connects
        assert!(sessions.begins() < max_attempts.max(1));
        let sse_with_session = attempts
            .iter()
            .filter(|a| a.mode == HttpMode::Sse && a.auth == AuthMode::OAuth)
            .count();
        assert!(sse_with_session <= 1);
    }
}

#[tokio::test]
async fn test_consent_timeout_is_terminal() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let connector = FakeConnector::new();
    let sessions = FakeSessionFactory::timing_out();
    let rt = runtime(vec![linear()], connector.clone(), sessions.clone(), tmp.path());

    let err = rt
        .connect("linear", ConnectOptions::default())
        .await
        .expect_err("timeout");
    assert!(is_oauth_timeout(&err));

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| a.mode == HttpMode::Streamable));
}

#[tokio::test]
async fn test_non_interactive_never_creates_sessions() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let connector = FakeConnector::new();
    let sessions = FakeSessionFactory::granting();
    let rt = runtime(vec![linear()], connector.clone(), sessions.clone(), tmp.path());

    let err = rt
        .list_tools(
            "linear",
            ListToolsOptions {
                include_schema: false,
                auto_authorize: false,
            },
        )
        .await
        .expect_err("auth required");
    assert!(is_auth_error(&err));
    assert_eq!(sessions.created(), 0);
    assert_eq!(connector.attempts().len(), 2);
}

#[tokio::test]
async fn test_authorize_forces_oauth_and_caches_connection() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let connector = FakeConnector::new();
    let sessions = FakeSessionFactory::granting();
    let rt = runtime(vec![linear()], connector.clone(), sessions.clone(), tmp.path());

    rt.authorize("linear").await.expect("authorize");
    assert_eq!(rt.connected_servers().await, ["linear"]);
    let attempts = connector.attempts();
    assert!(attempts.iter().all(|a| a.auth == AuthMode::OAuth));
    assert_eq!(sessions.created(), 1);

    // Cached: no further attempts
    rt.list_tools("linear", ListToolsOptions::default())
        .await
        .expect("list");
    assert_eq!(connector.attempts().len(), attempts.len());
}

#[tokio::test]
async fn test_authorize_rejects_stdio_servers() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let rt = runtime(
        vec![super::support::files_server()],
        FakeConnector::new(),
        FakeSessionFactory::granting(),
        tmp.path(),
    );
    assert!(rt.authorize("files").await.is_err());
}
