// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP and Unix-socket listeners.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use obshell_security::PeerPolicy;
use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tracing::{info, warn};

use crate::envelope::local::PeerUid;
use crate::routes::{create_local_router, create_router};
use crate::state::ServerState;

/// Listener failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The TCP address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Cause.
        source: io::Error,
    },
    /// The socket path could not be prepared or bound.
    #[error("failed to bind socket {path}: {source}")]
    Socket {
        /// Socket path.
        path: PathBuf,
        /// Cause.
        source: io::Error,
    },
    /// The server stopped with an error.
    #[error("server error: {0}")]
    Serve(#[from] io::Error),
}

/// Bind the agent's TCP address.
pub async fn bind_tcp(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Serve the API on `listener` until `shutdown` completes.
pub async fn serve_tcp(
    listener: TcpListener,
    state: ServerState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    info!(addr = ?addr, "HTTP listener started");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("HTTP listener stopped");
    Ok(())
}

/// Bind the administrative socket, replacing a stale one.
pub fn bind_socket(path: &Path) -> Result<UnixListener, ServerError> {
    let socket_err = |source| ServerError::Socket {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(socket_err)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => warn!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(socket_err(e)),
    }
    UnixListener::bind(path).map_err(socket_err)
}

/// Serve the API on the administrative socket until `shutdown` completes.
/// Only peers admitted by `policy` get past the envelope.
pub async fn serve_socket(
    listener: UnixListener,
    state: ServerState,
    policy: PeerPolicy,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    info!("Socket listener started");
    let app = create_local_router(state, Arc::new(policy));
    axum::serve(listener, app.into_make_service_with_connect_info::<PeerUid>())
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Socket listener stopped");
    Ok(())
}
