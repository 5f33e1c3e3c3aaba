//! Listener set and lifecycle
//!
//! One [`Epoxy`] holds the shared router. Each listener wraps it with its
//! own middleware chain and bind address; all listeners are served together
//! and stop together when the shared cancellation token fires.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::middleware::{Middleware, apply_chain, execution_order};
use super::router::{AssetsConfig, Mux, Route};
use crate::config::normalize_addr;
use crate::{Error, Result};

/// The shared router, before or after a middleware chain is applied
#[derive(Debug, Clone)]
pub struct Epoxy {
    router: Router,
}

impl Epoxy {
    /// Build the router for `routes` and optional static assets.
    pub fn new(
        assets: Option<AssetsConfig<'_>>,
        routes: &[Route],
        client: &reqwest::Client,
    ) -> Result<Self> {
        let mux = Mux::new(routes, assets, client)?;
        Ok(Self {
            router: mux.into_router(),
        })
    }

    /// A copy of this router wrapped by `middlewares` (first = innermost).
    #[must_use]
    pub fn with_middlewares(&self, middlewares: &[Arc<dyn Middleware>]) -> Self {
        info!(chain = ?execution_order(middlewares), "Applying middleware chain");
        Self {
            router: apply_chain(self.router.clone(), middlewares),
        }
    }

    /// Fix this handler to a listener `name` and bind address.
    #[must_use]
    pub fn finalize(self, name: impl Into<String>, addr: impl AsRef<str>) -> Listener {
        Listener {
            name: name.into(),
            addr: normalize_addr(addr.as_ref()),
            router: self.router,
        }
    }

    /// The router, e.g. for driving requests in-process
    #[must_use]
    pub fn into_router(self) -> Router {
        self.router
    }
}

/// A named handler with its bind address, not yet bound
#[derive(Debug, Clone)]
pub struct Listener {
    name: String,
    addr: String,
    router: Router,
}

impl Listener {
    /// Listener name used in logs
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured bind address
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Bind the socket.
    pub async fn bind(self) -> Result<BoundListener> {
        let listener = TcpListener::bind(&self.addr).await.map_err(|source| Error::Bind {
            name: self.name.clone(),
            addr: self.addr.clone(),
            source,
        })?;
        let local_addr = listener.local_addr()?;
        Ok(BoundListener {
            name: self.name,
            local_addr,
            listener,
            router: self.router,
        })
    }
}

/// A listener with its socket bound
#[derive(Debug)]
pub struct BoundListener {
    name: String,
    local_addr: SocketAddr,
    listener: TcpListener,
    router: Router,
}

impl BoundListener {
    /// Address actually bound (useful with port 0)
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Listener name used in logs
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn run(self, shutdown: CancellationToken, grace: Duration) -> Result<()> {
        let Self {
            name,
            local_addr,
            listener,
            router,
        } = self;
        info!(listener = %name, addr = %local_addr, "Listening");

        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
        let server = server.into_future();
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => {
                return result.map_err(|e| Error::Internal(format!("listener '{name}': {e}")));
            }
            () = shutdown.cancelled() => {}
        }

        // Cancelled: in-flight requests get `grace` to finish.
        match tokio::time::timeout(grace, &mut server).await {
            Ok(result) => {
                info!(listener = %name, "Listener stopped");
                result.map_err(|e| Error::Internal(format!("listener '{name}': {e}")))
            }
            Err(_) => {
                warn!(listener = %name, grace = ?grace, "Shutdown grace period exceeded, abandoning in-flight requests");
                Ok(())
            }
        }
    }
}

/// Bind every listener, then serve them until `shutdown` fires.
///
/// If any address cannot be bound nothing is served.
pub async fn serve(listeners: Vec<Listener>, shutdown: CancellationToken, grace: Duration) -> Result<()> {
    let mut bound = Vec::with_capacity(listeners.len());
    for listener in listeners {
        bound.push(listener.bind().await?);
    }
    serve_bound(bound, shutdown, grace).await
}

/// Serve already bound listeners concurrently.
///
/// Waits for all of them and returns the first error, if any. A listener
/// that fails on its own does not stop the others.
pub async fn serve_bound(
    listeners: Vec<BoundListener>,
    shutdown: CancellationToken,
    grace: Duration,
) -> Result<()> {
    if listeners.is_empty() {
        warn!("No listeners configured");
        return Ok(());
    }

    let mut tasks = JoinSet::new();
    for listener in listeners {
        tasks.spawn(listener.run(shutdown.clone(), grace));
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(|e| Error::Internal(format!("listener task failed: {e}")));
        if let Err(e) = result.and_then(|r| r) {
            warn!(error = %e, "Listener exited with error");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
pub async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
        () = shutdown.cancelled() => return,
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
