// Copyright (C) 2025 Matías Salinas (support@fenden.com)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error Shaper (spec.md §4.H): dialect-specific error bodies, and the
//! SSE error frame used once streaming has begun.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use crate::error::GatewayError;
use crate::preflight::Dialect;

/// Builds the dialect-specific JSON error body (spec.md §4.H).
pub fn error_body(dialect: Dialect, error_type: &str, message: &str) -> Value {
    match dialect {
        Dialect::Responses => json!({
            "error": { "type": error_type, "message": message }
        }),
        Dialect::Messages => json!({
            "type": "error",
            "error": { "type": error_type, "message": message }
        }),
    }
}

/// Builds the `(status, body)` pair the client receives when streaming has
/// not yet started.
pub fn shape(dialect: Dialect, err: &GatewayError) -> (StatusCode, Value) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, error_body(dialect, err.error_type(), &err.to_string()))
}

/// Renders `err` as a full axum response in the given dialect.
pub fn into_response(dialect: Dialect, err: &GatewayError) -> Response {
    let (status, body) = shape(dialect, err);
    (status, Json(body)).into_response()
}

/// The SSE frame used to deliver an error after the first byte of the
/// stream has already reached the client (spec.md §4.H): `event: error`
/// followed by a JSON `data:` line and a blank line terminator.
pub fn sse_error_frame(error_type: &str, message: &str) -> String {
    let body = json!({ "error": { "type": error_type, "message": message } });
    format!("event: error\ndata: {body}\n\n")
}
