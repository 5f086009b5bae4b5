// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Uniform response wrapper.
//!
//! Handlers and middleware never write bodies directly. They attach an
//! [`OcsResponse`] to the response extensions and the outermost envelope
//! layer renders it with the request's trace id and duration.

use axum::extract::{FromRequest, Json, Request};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use obshell_core::response::OcsResponse;
use obshell_core::{Error, ErrorKind};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::error;

use crate::envelope::RequestMeta;

/// Result type of every handler.
pub type ApiResult<T> = std::result::Result<Reply<T>, ApiFailure>;

/// Successful handler output.
#[derive(Debug)]
pub struct Reply<T>(pub Option<T>);

impl<T> Reply<T> {
    /// Reply carrying `data`.
    pub fn data(data: T) -> Self {
        Self(Some(data))
    }
}

impl Reply<()> {
    /// Reply without payload.
    pub fn empty() -> Self {
        Self(None)
    }
}

impl<T: Serialize> IntoResponse for Reply<T> {
    fn into_response(self) -> Response {
        match self.0.map(serde_json::to_value).transpose() {
            Ok(data) => pending(OcsResponse::ok(data)),
            Err(e) => ApiFailure(Error::from(e)).into_response(),
        }
    }
}

/// Failed handler output.
#[derive(Debug)]
pub struct ApiFailure(pub Error);

impl From<Error> for ApiFailure {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<obshell_security::SecurityError> for ApiFailure {
    fn from(err: obshell_security::SecurityError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        if self.0.http_status() >= 500 {
            error!(code = self.0.code(), error = %self.0, "Request failed");
        }
        pending(OcsResponse::fail(&self.0))
    }
}

/// Response body awaiting its trace id.
#[derive(Debug, Clone)]
pub(crate) struct PendingBody(pub OcsResponse);

/// An empty response carrying `body` for the envelope to render.
pub fn pending(body: OcsResponse) -> Response {
    let status = StatusCode::from_u16(body.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = status.into_response();
    response.extensions_mut().insert(PendingBody(body));
    response
}

/// Render a pending body, if any, stamped with the request's trace id,
/// duration and language.
pub(crate) fn render(response: &mut Response, meta: &RequestMeta, duration_ms: u64) {
    let Some(PendingBody(body)) = response.extensions_mut().remove::<PendingBody>() else {
        return;
    };
    let body = body
        .traced(&meta.trace_id, duration_ms)
        .in_language(meta.language.as_deref());
    let bytes = match serde_json::to_vec(&body) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "Failed to render response");
            return;
        }
    };
    response.headers_mut().insert(
        CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    *response.body_mut() = axum::body::Body::from(bytes);
}

/// JSON body extractor whose rejection is wrapped like any other failure.
#[derive(Debug, Clone)]
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiFailure;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiFailure(Error::with_args(
                ErrorKind::CommonBadRequest,
                [rejection.body_text()],
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn meta(trace_id: &str, language: Option<&str>) -> RequestMeta {
        RequestMeta {
            trace_id: trace_id.to_string(),
            language: language.map(str::to_string),
            started: std::time::Instant::now(),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_failure_renders_with_trace() {
        let mut response =
            ApiFailure(Error::with_args(ErrorKind::TaskNotFound, ["011"])).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        render(&mut response, &meta("trace-1", Some("zh-CN")), 4);

        let body = body_json(response).await;
        assert_eq!(body["successful"], false);
        assert_eq!(body["trace_id"], "trace-1");
        assert_eq!(body["duration_ms"], 4);
        assert_eq!(body["error"]["code"], "TASK_NOT_FOUND");
        assert_eq!(body["error"]["language"], "zh-CN");
    }

    #[tokio::test]
    async fn test_reply_without_payload_omits_data() {
        let mut response = Reply::empty().into_response();
        render(&mut response, &meta("trace-2", None), 0);
        let body = body_json(response).await;
        assert_eq!(body["status"], 200);
        assert_eq!(body["successful"], true);
        assert!(body.get("data").is_none());
    }
}
