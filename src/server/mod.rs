//! Project API server
//!
//! Serves list, watch and CRUD for projects over HTTP, with watches streamed
//! over WebSocket.

pub mod http;
mod registry;

pub use http::{create_router, HttpState};
pub use registry::{ApiError, ListOptions, ProjectList, ProjectRegistry, RegistryWatch, RequestContext, RESOURCE_VERSION_ALL};

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Secret for verifying session tokens
    pub token_secret: Vec<u8>,
}

/// The project API server
pub struct ProjectServer {
    config: ServerConfig,
    registry: Arc<ProjectRegistry>,
}

impl ProjectServer {
    pub fn new(config: ServerConfig, registry: ProjectRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
        }
    }

    /// Serve until `shutdown` resolves, then stop the authorization cache
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let app = create_router(HttpState::new(self.registry.clone(), self.config.token_secret.clone()));

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.bind_addr))?;
        info!(addr = %self.config.bind_addr, "Project API listening");

        // Stopping the cache closes every open watch, letting their sockets finish
        let cache = self.registry.cache().clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("Shutdown requested, stopping authorization cache");
                cache.shutdown().await;
            })
            .await?;

        Ok(())
    }
}
