//! API server lifecycle: bind, serve with peer addresses, shut down.
//!
//! Peer addresses are required by the loopback fallback, so the router is
//! always served through `into_make_service_with_connect_info`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::api::router::api_router;
use crate::core_state::CoreState;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata of a running server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub addr: SocketAddr,
    pub started_at: String,
}

/// Handle to a server running in a background task.
pub struct ApiServer {
    pub info: ServerInfo,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ApiServer {
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            tracing::info!(addr = %self.info.addr, "API server shutdown signal sent");
        }
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

async fn serve_on(
    listener: TcpListener,
    core: Arc<CoreState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let app = api_router(core);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

/// Serve on the configured bind address until `shutdown` resolves.
pub async fn serve(
    core: Arc<CoreState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let listener = bind(core.config().bind).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "API server listening");
    serve_on(listener, core, shutdown).await?;
    tracing::info!("API server stopped");
    Ok(())
}

/// Start the server in a background task and return a handle.
pub async fn start_server(core: Arc<CoreState>) -> Result<ApiServer, ServerError> {
    let listener = bind(core.config().bind).await?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = serve_on(listener, core, shutdown).await {
            tracing::error!(error = %e, "API server error");
        }
        tracing::info!(%addr, "API server stopped");
    });

    tracing::info!(%addr, "API server started");
    Ok(ApiServer {
        info: ServerInfo {
            addr,
            started_at: chrono::Utc::now().to_rfc3339(),
        },
        shutdown_tx: Some(shutdown_tx),
    })
}

/// Resolves on Ctrl-C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
