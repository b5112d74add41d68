//! Local HTTP listener that captures the OAuth redirect.
//!
//! A listener lives for one sign-in attempt:
//! `Listening → (CodeReceived | ErrorReceived) → Closing → closed`.
//! The first `code` or `error` redirect is forwarded to the coordinator over
//! an mpsc channel; the browser gets a static page and the listener shuts
//! itself down after a grace delay so the page can finish rendering.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{CuratorError, Result};

/// What the provider sent back to the redirect URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectOutcome {
    /// Authorization succeeded.
    Code {
        code: String,
        state: Option<String>,
    },
    /// The provider reported an error (e.g. the user cancelled).
    Error {
        error: String,
        description: Option<String>,
    },
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Port to bind on the loopback interface.
    pub port: u16,
    /// Path the provider redirects to.
    pub redirect_path: String,
    /// Delay between answering a terminal redirect and closing.
    pub grace_period: Duration,
    /// Wait before the single bind retry when the port is taken.
    pub bind_retry_delay: Duration,
}

#[derive(Debug, Deserialize)]
struct RedirectParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

struct RedirectState {
    outcomes: mpsc::Sender<RedirectOutcome>,
    shutdown: Arc<watch::Sender<bool>>,
    closing: Arc<AtomicBool>,
    grace_period: Duration,
}

impl RedirectState {
    /// Marks the listener as closing and schedules shutdown.
    ///
    /// Returns `false` if a terminal redirect was already handled.
    fn begin_closing(&self) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            return false;
        }
        let shutdown = Arc::clone(&self.shutdown);
        let grace = self.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = shutdown.send(true);
        });
        true
    }
}

/// A running loopback redirect listener.
pub struct LoopbackServer {
    shutdown: Arc<watch::Sender<bool>>,
    closing: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl LoopbackServer {
    /// Binds the listener and starts serving.
    ///
    /// If the port is already in use, waits `bind_retry_delay` and tries once
    /// more before giving up.
    ///
    /// # Errors
    ///
    /// Returns [`CuratorError::PortBind`] if the port cannot be bound.
    pub async fn start(
        options: &LoopbackOptions,
        outcomes: mpsc::Sender<RedirectOutcome>,
    ) -> Result<Self> {
        let listener = bind_with_retry(options.port, options.bind_retry_delay).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);
        let closing = Arc::new(AtomicBool::new(false));

        let state = Arc::new(RedirectState {
            outcomes,
            shutdown: Arc::clone(&shutdown),
            closing: Arc::clone(&closing),
            grace_period: options.grace_period,
        });

        let app = Router::new()
            .route(&options.redirect_path, get(handle_redirect))
            .fallback(not_found)
            .with_state(state);

        let task = tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(signal).await {
                tracing::warn!(error = %e, "Loopback listener stopped with an error");
            }
            tracing::debug!(%local_addr, "Loopback listener closed");
        });

        tracing::info!(%local_addr, "Listening for sign-in redirect");
        Ok(Self {
            shutdown,
            closing,
            task,
        })
    }

    /// Whether the listener still accepts a new sign-in attempt.
    ///
    /// `false` once a terminal redirect arrived or the listener stopped.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    /// Shuts the listener down now and waits until the port is released.
    pub async fn close(self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Loopback listener task failed");
        }
    }
}

async fn bind_with_retry(port: u16, retry_delay: Duration) -> Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            tracing::warn!(port, "Redirect port in use, retrying once after {retry_delay:?}");
            tokio::time::sleep(retry_delay).await;
            TcpListener::bind(addr)
                .await
                .map_err(|source| CuratorError::PortBind { port, source })
        },
        Err(source) => Err(CuratorError::PortBind { port, source }),
    }
}

async fn handle_redirect(
    State(state): State<Arc<RedirectState>>,
    Query(params): Query<RedirectParams>,
) -> Response {
    if let Some(code) = params.code {
        if state.begin_closing() {
            tracing::info!("Authorization code received");
            let _ = state
                .outcomes
                .send(RedirectOutcome::Code {
                    code,
                    state: params.state,
                })
                .await;
        }
        return Html(SUCCESS_PAGE).into_response();
    }

    if let Some(error) = params.error {
        let message = params
            .error_description
            .clone()
            .unwrap_or_else(|| error.clone());
        if state.begin_closing() {
            tracing::warn!(%error, description = %message, "Provider redirected with an error");
            let _ = state
                .outcomes
                .send(RedirectOutcome::Error {
                    error,
                    description: params.error_description,
                })
                .await;
        }
        return Html(failure_page(&message)).into_response();
    }

    (
        StatusCode::BAD_REQUEST,
        Html(failure_page("The sign-in response was missing its authorization code.")),
    )
        .into_response()
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

const SUCCESS_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Signed in - Community Curator</title></head>
<body style="font-family: sans-serif; text-align: center; margin-top: 15vh;">
  <h1>Authentication Successful!</h1>
  <p>You can close this window and return to the app.</p>
  <script>setTimeout(() => window.close(), 2000);</script>
</body>
</html>
"#;

fn failure_page(message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Sign-in failed - Community Curator</title></head>
<body style="font-family: sans-serif; text-align: center; margin-top: 15vh;">
  <h1>Authentication Failed</h1>
  <p>{}</p>
</body>
</html>
"#,
        escape_html(message)
    )
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Finds a port that is free right now.
    pub(crate) fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    pub(crate) fn options(port: u16) -> LoopbackOptions {
        LoopbackOptions {
            port,
            redirect_path: "/".to_string(),
            grace_period: Duration::from_millis(50),
            bind_retry_delay: Duration::from_millis(100),
        }
    }

    /// Polls until `port` can be bound again.
    pub(crate) async fn wait_until_released(port: u16) {
        for _ in 0..50 {
            if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("port {port} still bound");
    }

    #[tokio::test]
    async fn code_redirect_is_forwarded_and_listener_closes() {
        let port = free_port();
        let (tx, mut rx) = mpsc::channel(4);
        let server = LoopbackServer::start(&options(port), tx).await.unwrap();
        assert!(server.is_accepting());

        let body = reqwest::get(format!("http://127.0.0.1:{port}/?code=abc&state=xyz"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("Authentication Successful"));

        assert_eq!(
            rx.recv().await,
            Some(RedirectOutcome::Code {
                code: "abc".to_string(),
                state: Some("xyz".to_string()),
            })
        );
        assert!(!server.is_accepting());

        // The listener drops its sender once closed.
        assert_eq!(rx.recv().await, None);
        wait_until_released(port).await;
    }

    #[tokio::test]
    async fn error_redirect_renders_escaped_description() {
        let port = free_port();
        let (tx, mut rx) = mpsc::channel(4);
        let _server = LoopbackServer::start(&options(port), tx).await.unwrap();

        let response = reqwest::get(format!(
            "http://127.0.0.1:{port}/?error=access_denied&error_description=User%20%3Cb%3Ecancelled%3C%2Fb%3E"
        ))
        .await
        .unwrap();
        assert_eq!(response.status(), 200);
        let body = response.text().await.unwrap();
        assert!(body.contains("User &lt;b&gt;cancelled&lt;/b&gt;"));

        assert_eq!(
            rx.recv().await,
            Some(RedirectOutcome::Error {
                error: "access_denied".to_string(),
                description: Some("User <b>cancelled</b>".to_string()),
            })
        );
        wait_until_released(port).await;
    }

    #[tokio::test]
    async fn other_paths_are_not_found() {
        let port = free_port();
        let (tx, _rx) = mpsc::channel(4);
        let server = LoopbackServer::start(&options(port), tx).await.unwrap();

        let response = reqwest::get(format!("http://127.0.0.1:{port}/favicon.ico"))
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
        assert!(server.is_accepting());
        server.close().await;
    }

    #[tokio::test]
    async fn redirect_without_code_or_error_keeps_listening() {
        let port = free_port();
        let (tx, _rx) = mpsc::channel(4);
        let server = LoopbackServer::start(&options(port), tx).await.unwrap();

        let response = reqwest::get(format!("http://127.0.0.1:{port}/?foo=bar"))
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        assert!(server.is_accepting());
        server.close().await;
    }

    #[tokio::test]
    async fn only_first_terminal_redirect_is_forwarded() {
        let port = free_port();
        let (tx, mut rx) = mpsc::channel(4);
        let mut opts = options(port);
        opts.grace_period = Duration::from_millis(300);
        let _server = LoopbackServer::start(&opts, tx).await.unwrap();

        for code in ["first", "second"] {
            reqwest::get(format!("http://127.0.0.1:{port}/?code={code}"))
                .await
                .unwrap();
        }

        assert_eq!(
            rx.recv().await,
            Some(RedirectOutcome::Code {
                code: "first".to_string(),
                state: None,
            })
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn close_releases_port_immediately() {
        let port = free_port();
        let (tx, _rx) = mpsc::channel(4);
        let server = LoopbackServer::start(&options(port), tx).await.unwrap();
        server.close().await;
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[tokio::test]
    async fn busy_port_fails_after_one_retry() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();
        let (tx, _rx) = mpsc::channel(4);

        let started = std::time::Instant::now();
        let result = LoopbackServer::start(&options(port), tx).await;
        assert!(matches!(result, Err(CuratorError::PortBind { port: p, .. }) if p == port));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn busy_port_freed_during_retry_delay_binds() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();
        let (tx, _rx) = mpsc::channel(4);

        let mut opts = options(port);
        opts.bind_retry_delay = Duration::from_millis(300);
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(blocker);
        });

        let server = LoopbackServer::start(&opts, tx).await.unwrap();
        release.await.unwrap();
        assert!(server.is_accepting());
        assert!(reqwest::get(format!("http://127.0.0.1:{port}/elsewhere"))
            .await
            .is_ok());
        server.close().await;
    }

    #[test]
    fn escape_html_neutralizes_markup() {
        assert_eq!(
            escape_html(r#"<script>alert("x") & 'y'</script>"#),
            "&lt;script&gt;alert(&quot;x&quot;) &amp; &#39;y&#39;&lt;/script&gt;"
        );
    }
}
