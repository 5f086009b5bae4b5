// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! obshell Server - the HTTP face of an obshell agent.
//!
//! Every request passes the same envelope before reaching a handler:
//!
//! ```text
//!   request ──► trace id ──► verify ──► body decrypt ──► [forward] ──► handler
//!                  ▲                                                     │
//!                  └──────────── uniform response wrapper ◄──────────────┘
//! ```
//!
//! - `/api/v1/*` accepts database-authenticated headers, agent headers and
//!   sessions.
//! - `/rpc/v1/*` accepts agent headers only.
//! - `GET /api/v1/secret` and `GET /api/v1/status` are unauthenticated.
//!
//! The same router is served on TCP and on the Unix-domain administrative
//! socket, where the peer's UID replaces the header.

#![deny(missing_docs)]

/// Request envelope middleware.
pub mod envelope;

/// Route handlers.
pub mod handlers;

/// Uniform response wrapper.
pub mod response;

/// Router assembly.
pub mod routes;

/// TCP and Unix-socket listeners.
pub mod server;

/// Background session sweeper.
pub mod sessions;

/// Shared handler state.
pub mod state;

pub use routes::create_router;
pub use state::{AgentLifecycle, ServerState};
