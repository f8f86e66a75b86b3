//! Management API Server

use super::{api::ManagementApi, handlers::AppState};
use crate::relay::RelayServer;
use crate::shutdown::ShutdownSignal;
use crate::Result;
use anyhow::Context;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Management API server
pub struct ManagementServer {
    bind_addr: SocketAddr,
    app_state: AppState,
}

impl ManagementServer {
    pub fn new(bind_addr: SocketAddr, server: Arc<RelayServer>, metrics_enabled: bool) -> Self {
        Self {
            bind_addr,
            app_state: AppState {
                server,
                metrics_enabled,
            },
        }
    }

    /// Bind the HTTP listener. The returned future serves until `shutdown`.
    pub async fn bind(self) -> Result<BoundManagementServer> {
        let listener = TcpListener::bind(self.bind_addr).await.with_context(|| {
            format!("Failed to bind management API server to {}", self.bind_addr)
        })?;
        let local_addr = listener.local_addr()?;
        info!("Management API server listening on {}", local_addr);

        Ok(BoundManagementServer {
            listener,
            local_addr,
            router: ManagementApi::create_router(self.app_state),
        })
    }

    /// Bind and serve until `shutdown` is raised
    pub async fn start(self, shutdown: ShutdownSignal) -> Result<()> {
        self.bind().await?.serve(shutdown).await
    }

    /// Create a router for testing
    pub fn create_test_router(&self) -> Router {
        ManagementApi::create_router(self.app_state.clone())
    }
}

/// Management server with its listening socket already bound
pub struct BoundManagementServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
}

impl BoundManagementServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn serve(self, shutdown: ShutdownSignal) -> Result<()> {
        let result = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await;

        if let Err(e) = result {
            error!("Management API server error: {}", e);
            return Err(e.into());
        }

        info!("Management API server stopped");
        Ok(())
    }
}
