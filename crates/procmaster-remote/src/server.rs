//! Remote server: binds the configured listen address and serves the API
//! until a shutdown signal resolves.

use crate::api::create_router;
use axum::Router;
use procmaster_supervisor::{ListenAddress, SupervisorService};
use std::future::Future;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::UnixListener;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),

    #[error("Unsupported listen address on this platform: {0}")]
    Unsupported(String),
}

enum BoundListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

/// HTTP server for one [`SupervisorService`], bound to its listen address.
pub struct RemoteServer {
    listener: BoundListener,
    router: Router,
}

impl RemoteServer {
    /// Bind `address` and prepare the router.
    ///
    /// A stale Unix socket file at the path is removed first.
    pub async fn bind(address: &ListenAddress, service: SupervisorService) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind {
            address: address.to_string(),
            source,
        };

        let listener = match address {
            ListenAddress::Tcp(addr) => {
                info!("Binding to TCP: {}", addr);
                BoundListener::Tcp(TcpListener::bind(addr.as_str()).await.map_err(bind_err)?)
            }

            #[cfg(unix)]
            ListenAddress::Unix(path) => {
                info!("Binding to Unix socket: {}", path.display());
                if path.exists() {
                    std::fs::remove_file(path).map_err(bind_err)?;
                }
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(bind_err)?;
                }
                BoundListener::Unix(UnixListener::bind(path).map_err(bind_err)?, path.clone())
            }

            #[cfg(not(unix))]
            ListenAddress::Unix(_) => return Err(ServerError::Unsupported(address.to_string())),
        };

        Ok(Self {
            listener,
            router: create_router(service),
        })
    }

    /// Local TCP address, when listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            BoundListener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            BoundListener::Unix(..) => None,
        }
    }

    /// Serve requests until `shutdown` resolves, then finish in-flight
    /// requests and return.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.listener {
            BoundListener::Tcp(listener) => {
                if let Ok(addr) = listener.local_addr() {
                    info!("Server listening on {}", addr);
                }
                axum::serve(listener, self.router)
                    .with_graceful_shutdown(shutdown)
                    .await
                    .map_err(ServerError::Serve)?;
            }

            #[cfg(unix)]
            BoundListener::Unix(listener, path) => {
                info!("Server listening on {}", path.display());
                let served = axum::serve(listener, self.router)
                    .with_graceful_shutdown(shutdown)
                    .await;
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Failed to remove socket {}: {}", path.display(), e);
                }
                served.map_err(ServerError::Serve)?;
            }
        }

        info!("Remote server stopped");
        Ok(())
    }
}
