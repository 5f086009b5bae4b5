// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Peer-credential admission on the administrative socket.

use std::sync::Arc;

use axum::extract::connect_info::Connected;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::serve::IncomingStream;
use obshell_core::{Error, ErrorKind};
use obshell_security::PeerPolicy;
use tokio::net::UnixListener;
use tracing::warn;

use crate::response::ApiFailure;

/// UID of the process on the other end of a Unix-socket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerUid(pub Option<u32>);

impl Connected<IncomingStream<'_, UnixListener>> for PeerUid {
    fn connect_info(stream: IncomingStream<'_, UnixListener>) -> Self {
        Self(stream.io().peer_cred().ok().map(|cred| cred.uid()))
    }
}

/// Marker of a request admitted on the administrative socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalPeer {
    /// Admitted UID.
    pub uid: u32,
}

/// Admit the connection's UID or reject with `SECURITY_PERMISSION_DENIED`.
pub async fn admit_local_peer(
    State(policy): State<Arc<PeerPolicy>>,
    ConnectInfo(peer): ConnectInfo<PeerUid>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(uid) = peer.0 else {
        return ApiFailure(Error::with_args(
            ErrorKind::SecurityPermissionDenied,
            ["peer credentials unavailable"],
        ))
        .into_response();
    };
    if let Err(e) = policy.check(uid) {
        warn!(uid, path = %req.uri().path(), "Rejected socket peer");
        return ApiFailure::from(e).into_response();
    }
    req.extensions_mut().insert(LocalPeer { uid });
    next.run(req).await
}
