//! Health and metrics endpoints.
//!
//! - `GET /healthz`: fixed 200, empty body (liveness)
//! - `GET /readyz`: 200 while the RPC server is running, 503 otherwise
//! - `GET /metrics`: Prometheus text exposition, 404 when no recorder is
//!   installed
//!
//! The HTTP server has its own accept loop and shares nothing mutable with
//! the RPC server; it only watches the RPC server's state.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::lifecycle::{notify_channel, Notify, ServerState, StateCell};
use crate::{
    // ---
    log_error,
    log_info,
    log_warn,
    Error,
    Result,
};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub app_name: Arc<str>,
    pub app_version: Arc<str>,
    pub rpc_state: watch::Receiver<ServerState>,
    pub metrics: Option<PrometheusHandle>,
}

/// Build the axum router. Exposed separately so it can be driven without a
/// socket.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<HttpState>) -> (StatusCode, Json<Value>) {
    // ---
    let rpc = *state.rpc_state.borrow();
    let (code, status) = match rpc {
        ServerState::Running => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };

    let body = json!({
        "status": status,
        "rpc": rpc.to_string(),
        "app": &*state.app_name,
        "version": &*state.app_version,
    });
    (code, Json(body))
}

async fn render_metrics(State(state): State<HttpState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Running HTTP server.
pub struct HttpServer {
    // ---
    local_addr: SocketAddr,
    state: Arc<StateCell>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpServer {
    /// Bind `addr` and start serving.
    ///
    /// The returned [`Notify`] resolves with the serve error if the accept
    /// loop dies on its own.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the address cannot be bound.
    pub async fn start(
        addr: SocketAddr,
        state: HttpState,
        shutdown_timeout: Duration,
    ) -> Result<(HttpServer, Notify)> {
        // ---
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let app = router(state);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let (notifier, notify) = notify_channel();
        let lifecycle = Arc::new(StateCell::new());

        // The task bounds its own graceful phase so the stop completes even
        // if nobody awaits `shutdown()`.
        let task = tokio::spawn({
            let lifecycle = lifecycle.clone();
            async move {
                let (graceful_tx, graceful_rx) = oneshot::channel::<()>();
                let serve = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = graceful_rx.await;
                    })
                    .into_future();
                tokio::pin!(serve);

                let served = tokio::select! {
                    served = &mut serve => Some(served),
                    _ = &mut shutdown_rx => {
                        let _ = graceful_tx.send(());
                        match tokio::time::timeout(shutdown_timeout, &mut serve).await {
                            Ok(served) => Some(served),
                            Err(_) => {
                                log_warn!(
                                    "http server did not stop within {shutdown_timeout:?}; abandoning open connections"
                                );
                                None
                            }
                        }
                    }
                };

                if let Some(Err(e)) = served {
                    log_error!("http server failed: {e}");
                    notifier.notify(Error::Io(e));
                }

                lifecycle.advance(ServerState::Stopped);
                log_info!("http server stopped");
            }
        });

        log_info!("http server listening on {local_addr}");
        lifecycle.advance(ServerState::Running);

        let server = HttpServer {
            local_addr,
            state: lifecycle,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        };

        Ok((server, notify))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    /// Stop accepting and let open requests finish up to the shutdown
    /// timeout. Idempotent; later callers wait for the first stop.
    pub async fn shutdown(&self) -> Result<()> {
        // ---
        let signal = lock_ignore_poison(&self.shutdown_tx).take();
        let Some(signal) = signal else {
            self.state.wait_for(ServerState::Stopped).await;
            return Ok(());
        };

        self.state.advance(ServerState::ShuttingDown);
        let _ = signal.send(());

        let task = lock_ignore_poison(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log_error!("http server task failed: {e}");
                self.state.advance(ServerState::Stopped);
            }
        }

        Ok(())
    }
}
