// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Uniform response body shared by the HTTP surface and peer RPC.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, Error, Result};

/// `{status, successful, trace_id, duration_ms, data, error, sub_errors}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcsResponse<T = Value> {
    /// HTTP status.
    pub status: u16,
    /// Whether the call succeeded.
    pub successful: bool,
    /// Trace id of the request.
    #[serde(default)]
    pub trace_id: String,
    /// Handler duration.
    #[serde(default)]
    pub duration_ms: u64,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    /// Per-item errors of batch calls.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_errors: Vec<ApiError>,
}

impl<T> OcsResponse<T> {
    /// Successful response carrying `data`.
    pub fn ok(data: Option<T>) -> Self {
        Self {
            status: 200,
            successful: true,
            trace_id: String::new(),
            duration_ms: 0,
            data,
            error: None,
            sub_errors: Vec::new(),
        }
    }

    /// Failed response for `err`.
    pub fn fail(err: &Error) -> Self {
        Self {
            status: err.http_status(),
            successful: false,
            trace_id: String::new(),
            duration_ms: 0,
            data: None,
            error: Some(err.to_api_error()),
            sub_errors: Vec::new(),
        }
    }

    /// Stamp trace id and duration.
    pub fn traced(mut self, trace_id: impl Into<String>, duration_ms: u64) -> Self {
        self.trace_id = trace_id.into();
        self.duration_ms = duration_ms;
        self
    }

    /// Tag the carried error with the caller's language.
    pub fn in_language(mut self, language: Option<&str>) -> Self {
        if let (Some(error), Some(language)) = (self.error.as_mut(), language) {
            error.language = Some(language.to_string());
        }
        self
    }

    /// Payload, or the carried error.
    pub fn into_result(self) -> Result<Option<T>> {
        if self.successful {
            return Ok(self.data);
        }
        Err(self
            .error
            .map(|e| e.to_error())
            .unwrap_or_else(|| Error::unexpected(format!("status {}", self.status))))
    }
}

impl OcsResponse<Value> {
    /// Deserialize the untyped payload.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.data {
            None | Some(Value::Null) => Ok(None),
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
        }
    }
}
