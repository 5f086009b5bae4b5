// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Route handlers.
//!
//! Handlers are thin: they decode the request, call exactly one engine,
//! membership, credential or package operation and wrap its result.

pub mod agent;
pub mod credential;
pub mod package;
pub mod rpc;
pub mod security;
pub mod task;

use obshell_core::task::GenericId;
use obshell_core::{Error, ErrorKind, Result};

/// Parse a generic DAG id from a path segment.
pub(crate) fn parse_dag_id(raw: &str) -> Result<GenericId> {
    raw.parse()
        .map_err(|_| Error::with_args(ErrorKind::TaskNotFound, [raw]))
}

/// Parse a numeric row id from a path segment.
pub(crate) fn parse_row_id(raw: &str) -> Result<i64> {
    raw.parse()
        .map_err(|_| Error::illegal_argument(format!("id '{}'", raw)))
}
