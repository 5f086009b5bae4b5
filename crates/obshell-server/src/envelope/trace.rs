// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trace id, timing and response rendering.

use std::time::Instant;

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use obshell_core::remote::TRACE_ID_HEADER;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::response::render;

const TRACE_ID: HeaderName = HeaderName::from_static("x-obshell-trace-id");

/// Per-request metadata available to every later layer and handler.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    /// Trace id read from the request or freshly generated.
    pub trace_id: String,
    /// Primary language tag of `Accept-Language`, if any.
    pub language: Option<String>,
    /// Arrival time.
    pub started: Instant,
}

impl RequestMeta {
    /// Metadata of `req`.
    pub fn from_request(req: &Request) -> Self {
        let trace_id = req
            .headers()
            .get(TRACE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(new_trace_id);
        let language = req
            .headers()
            .get(axum::http::header::ACCEPT_LANGUAGE)
            .and_then(|v| v.to_str().ok())
            .and_then(primary_language);
        Self {
            trace_id,
            language,
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// A fresh 16-hex-digit trace id.
pub fn new_trace_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// First tag of an `Accept-Language` value, without its quality.
fn primary_language(value: &str) -> Option<String> {
    value
        .split(',')
        .next()
        .map(|tag| tag.split(';').next().unwrap_or(tag).trim())
        .filter(|tag| !tag.is_empty() && *tag != "*")
        .map(str::to_string)
}

/// Outermost layer.
pub async fn request_envelope(mut req: Request, next: Next) -> Response {
    let meta = RequestMeta::from_request(&req);
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(meta.clone());

    let span = info_span!(
        "request",
        trace_id = %meta.trace_id,
        method = %method,
        path = %path,
        language = meta.language.as_deref().unwrap_or("en"),
    );
    let mut response = next.run(req).instrument(span).await;

    let duration_ms = meta.elapsed_ms();
    render(&mut response, &meta, duration_ms);
    if let Ok(value) = HeaderValue::from_str(&meta.trace_id) {
        response.headers_mut().insert(TRACE_ID, value);
    }
    log_completion(&meta, &method, &path, response.status(), duration_ms);
    response
}

fn log_completion(meta: &RequestMeta, method: &Method, path: &str, status: StatusCode, duration_ms: u64) {
    let status = status.as_u16();
    let trace_id = meta.trace_id.as_str();
    if status >= 500 {
        error!(trace_id, method = %method, path, status, duration_ms, "Server error occurred");
    } else if status >= 400 {
        warn!(trace_id, method = %method, path, status, duration_ms, "Client error occurred");
    } else if method == Method::GET {
        debug!(trace_id, method = %method, path, status, duration_ms, "Request completed");
    } else {
        info!(trace_id, method = %method, path, status, duration_ms, "Request completed");
    }
}
