//! HTTP server implementation.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::guard::RequestGuard;
use super::service::{router, AppState};
use crate::error::{Result, WardenError};

/// HTTP server for the decision service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The guard every check goes through
    guard: RequestGuard,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, guard: RequestGuard) -> Self {
        Self { addr, guard }
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            WardenError::Io(e)
        })?;
        self.serve_listener(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            store = self.guard.limiter().store_name(),
            "Starting HTTP server for rate limit decisions"
        );

        let app = router(AppState::new(self.guard));
        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                WardenError::Http(e.to_string())
            })
    }
}
