//! Host composition.
//!
//! Starts the RPC server and the HTTP server, then blocks on whichever comes
//! first: an interrupt, or a fatal error from either server. Both servers are
//! shut down before returning.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Settings;
use crate::http::{HttpServer, HttpState};
use crate::lifecycle::Notify;
use crate::{
    // ---
    log_error,
    log_info,
    Result,
    Router,
    RpcServer,
    RpcServerBuilder,
    TransportPtr,
};

/// Both servers, running.
pub struct App {
    rpc: RpcServer,
    rpc_notify: Notify,
    http: HttpServer,
    http_notify: Notify,
}

impl App {
    /// Start the RPC server on `transport` and the HTTP server on
    /// `settings.http.port`.
    ///
    /// If the HTTP server cannot bind, the already started RPC server is shut
    /// down before the error is returned.
    pub async fn start(
        settings: &Settings,
        transport: TransportPtr,
        router: Router,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self> {
        // ---
        let (rpc, rpc_notify) = RpcServerBuilder::new(
            transport,
            router,
            settings.rabbitmq.rpc_server_exchange.as_str(),
        )
        .call_timeout(settings.rpc.call_timeout())
        .shutdown_timeout(settings.rpc.shutdown_timeout())
        .max_in_flight(settings.rpc.max_in_flight)
        .start()
        .await?;

        let state = HttpState {
            app_name: Arc::from(settings.app.name.as_str()),
            app_version: Arc::from(settings.app.version.as_str()),
            rpc_state: rpc.subscribe_state(),
            metrics,
        };
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.http.port));

        let (http, http_notify) =
            match HttpServer::start(addr, state, settings.rpc.shutdown_timeout()).await {
                Ok(started) => started,
                Err(e) => {
                    if let Err(stop) = rpc.shutdown().await {
                        log_error!("rpc server shutdown after http failure: {stop}");
                    }
                    return Err(e);
                }
            };

        log_info!(
            "{} {} started",
            settings.app.name,
            settings.app.version
        );

        Ok(Self {
            rpc,
            rpc_notify,
            http,
            http_notify,
        })
    }

    pub fn rpc(&self) -> &RpcServer {
        &self.rpc
    }

    pub fn http(&self) -> &HttpServer {
        &self.http
    }

    /// Run until `interrupt` completes or a server reports a fatal error,
    /// then shut both servers down.
    ///
    /// # Errors
    ///
    /// Returns the fatal server error that ended the run. An interrupt yields
    /// `Ok(())`. Shutdown failures are logged, not returned.
    pub async fn run_until<F>(self, interrupt: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        // ---
        let Self {
            rpc,
            rpc_notify,
            http,
            http_notify,
        } = self;

        let outcome = tokio::select! {
            _ = interrupt => {
                log_info!("interrupt received; shutting down");
                Ok(())
            }
            err = http_notify => match err {
                Some(e) => {
                    log_error!("http server failed: {e}");
                    Err(e)
                }
                None => Ok(()),
            },
            err = rpc_notify => match err {
                Some(e) => {
                    log_error!("rpc server failed: {e}");
                    Err(e)
                }
                None => Ok(()),
            },
        };

        if let Err(e) = http.shutdown().await {
            log_error!("http server shutdown: {e}");
        }
        if let Err(e) = rpc.shutdown().await {
            log_error!("rpc server shutdown: {e}");
        }

        outcome
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    // ---
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log_error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log_error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log_info!("received ctrl-c"),
        _ = terminate => log_info!("received SIGTERM"),
    }
}
