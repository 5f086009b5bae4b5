// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AES body decryption.
//!
//! When the verified header carries body keys, the request body is the
//! base64 AES-CBC ciphertext of the JSON payload. The plain payload replaces
//! the body; the ciphertext stays available as [`EncryptedBody`].

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use obshell_core::{Error, ErrorKind};
use tracing::debug;

use super::mask::masked_body;
use super::verify::Caller;
use crate::response::ApiFailure;

/// Upper bound of a buffered request body.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Ciphertext of a decrypted request body.
#[derive(Debug, Clone)]
pub struct EncryptedBody(pub Bytes);

/// Plain body of a request, kept for forwarding.
#[derive(Debug, Clone)]
pub struct PlainBody(pub Bytes);

/// Decrypt the body in place and log it masked.
pub async fn decrypt_body(req: Request, next: Next) -> Response {
    match decrypt(req).await {
        Ok(req) => next.run(req).await,
        Err(e) => ApiFailure(e).into_response(),
    }
}

async fn decrypt(req: Request) -> obshell_core::Result<Request> {
    let keys = match req.extensions().get::<Caller>().and_then(Caller::header) {
        Some(header) => header.body_keys()?,
        None => None,
    };
    let (mut parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::with_args(ErrorKind::CommonBadRequest, [e.to_string()]))?;

    let plain = match keys {
        Some(keys) if !bytes.is_empty() => {
            let plain = Bytes::from(keys.decrypt(&bytes)?);
            parts.extensions.insert(EncryptedBody(bytes));
            plain
        }
        _ => bytes,
    };
    if !plain.is_empty() && is_json(&parts.headers) {
        debug!(body = %masked_body(&plain), "Request body");
    }
    parts.extensions.insert(PlainBody(plain.clone()));
    Ok(Request::from_parts(parts, Body::from(plain)))
}

fn is_json(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false)
}
