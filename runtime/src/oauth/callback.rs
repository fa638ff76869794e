//! Loopback redirect listener
//!
//! A one-route axum server on 127.0.0.1 that receives the authorization
//! redirect and hands `code`/`state` to whoever is waiting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    response::Html,
    routing::get,
    Router,
};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

pub const CALLBACK_PATH: &str = "/callback";

/// Parameters delivered to the redirect URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: Option<String>,
}

type Delivery = std::result::Result<CallbackParams, String>;

#[derive(Clone)]
struct CallbackState {
    sender: Arc<Mutex<Option<oneshot::Sender<Delivery>>>>,
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<&'static str> {
    let delivery = match (params.get("code"), params.get("error")) {
        (Some(code), _) => Ok(CallbackParams {
            code: code.clone(),
            state: params.get("state").cloned(),
        }),
        (None, Some(error)) => Err(match params.get("error_description") {
            Some(description) => format!("{error}: {description}"),
            None => error.clone(),
        }),
        (None, None) => Err("redirect carried neither code nor error".to_string()),
    };
    let ok = delivery.is_ok();
    if let Some(sender) = state.sender.lock().await.take() {
        let _ = sender.send(delivery);
    }
    if ok {
        Html("<html><body><h3>Authorization complete.</h3><p>You can close this window.</p></body></html>")
    } else {
        Html("<html><body><h3>Authorization failed.</h3><p>Return to the terminal for details.</p></body></html>")
    }
}

/// Why waiting ended without a code
#[derive(Debug)]
pub enum WaitError {
    TimedOut,
    Denied(String),
    Closed,
}

/// A bound redirect listener
pub struct CallbackListener {
    port: u16,
    receiver: Mutex<Option<oneshot::Receiver<Delivery>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackListener {
    /// Bind on loopback, preferring `port` and falling back to any free port
    pub async fn bind(port: Option<u16>) -> Result<Self> {
        let listener = match port {
            Some(port) => match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::debug!("redirect port {} unavailable ({}), using a free port", port, e);
                    tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?
                }
            },
            None => tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?,
        };
        let port = listener
            .local_addr()
            .context("Failed to read redirect listener address")?
            .port();

        let (code_tx, code_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = Router::new()
            .route(CALLBACK_PATH, get(handle_callback))
            .with_state(CallbackState {
                sender: Arc::new(Mutex::new(Some(code_tx))),
            });

        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                tracing::warn!("OAuth redirect listener failed: {}", e);
            }
        });

        tracing::debug!("OAuth redirect listener on 127.0.0.1:{}", port);
        Ok(Self {
            port,
            receiver: Mutex::new(Some(code_rx)),
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, CALLBACK_PATH)
    }

    /// Wait for the redirect; only the first caller receives it
    pub async fn wait(&self, timeout: Duration) -> std::result::Result<CallbackParams, WaitError> {
        let Some(receiver) = self.receiver.lock().await.take() else {
            return Err(WaitError::Closed);
        };
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(Ok(params))) => Ok(params),
            Ok(Ok(Err(denied))) => Err(WaitError::Denied(denied)),
            Ok(Err(_)) => Err(WaitError::Closed),
            Err(_) => Err(WaitError::TimedOut),
        }
    }

    /// Stop serving; safe to call more than once
    pub async fn close(&self) {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                tracing::debug!("OAuth redirect listener did not stop in time");
            }
        }
    }
}
