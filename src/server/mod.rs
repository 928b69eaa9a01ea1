//! HTTP server wiring: state construction, router, middleware, graceful
//! shutdown.

pub mod admin;
pub mod middleware;
pub mod router;

pub use router::{AppState, create_router};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use crate::clock::MonotonicClock;
use crate::config::Config;
use crate::metrics::TelemetrySink;
use crate::{Error, Result};

/// Ops-guard server
pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    /// Build the full guard stack from configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let state = AppState::build(config, Arc::new(MonotonicClock), Arc::new(TelemetrySink));
        Self { state }
    }

    /// Shared state, for embedding or tests.
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Bind and serve until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.state
                .config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.state.config.server.port,
        );

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "Ops-guard listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Server shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
