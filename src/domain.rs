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

//! Entities shared across the admission, selection and recording pipeline.
//!
//! Storage schema is a concern of the `store` module's collaborators; these
//! types describe the semantic contract only.

use serde::{Deserialize, Serialize};

/// An end user of the gateway, billed in a two-decimal monetary balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    /// Monetary balance, stored as integer cents to avoid float drift.
    pub balance_cents: i64,
    /// Max simultaneous in-flight requests for this user.
    pub concurrency: u32,
    pub cache_read_transfer_ratio: Option<f64>,
    pub cache_read_transfer_probability: Option<f64>,
}

impl User {
    pub fn max_waiting(&self) -> u32 {
        crate::concurrency::calculate_max_wait(self.concurrency)
    }
}

/// Opaque credential bound to a user and a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub key_id: String,
    pub secret: String,
    pub user_id: String,
    pub group_id: String,
    pub enabled: bool,
}

/// A pool identity carrying pool-wide billing configuration and owning
/// zero or more accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub group_id: String,
    #[serde(default)]
    pub cache_read_transfer_ratio: f64,
    #[serde(default = "default_transfer_probability")]
    pub cache_read_transfer_probability: f64,
}

fn default_transfer_probability() -> f64 {
    1.0
}

/// Upstream provider credential belonging to a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub name: String,
    pub group_id: String,
    pub healthy: bool,
    pub max_concurrency: u32,
    pub base_url: String,
    pub credential: String,
    pub supported_models: Vec<String>,
}

impl Account {
    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_models.iter().any(|m| m == model)
    }
}

/// Per-user plan constraint consulted by the billing-eligibility check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: String,
    pub active: bool,
    /// Whether this subscription permits pay-as-you-go overdraft.
    pub allow_negative_balance: bool,
}

/// The usage block a provider returns, giving input/output/cache token
/// counts used for billing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageTokens {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

/// An append-only record of a successfully forwarded, billed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLog {
    pub request_id: String,
    pub user_id: String,
    pub account_id: String,
    pub model: String,
    pub stream: bool,
    pub user_agent: String,
    pub client_ip: String,
    pub duration_ms: u64,
    pub usage: UsageTokens,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// An append-only record of a failed request, carrying a sanitized
/// snapshot of the inbound request headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLog {
    pub request_id: String,
    pub user_id: Option<String>,
    pub is_error: bool,
    pub error_type: String,
    pub status_code: u16,
    pub message: String,
    pub error_body: String,
    pub headers_snapshot: Vec<(String, String)>,
    pub upstream_status_code: Option<u16>,
    pub upstream_message: Option<String>,
    pub sse_errors: Vec<String>,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// Default header whitelist captured into `ErrorLog.headers_snapshot`.
/// `Authorization` is special-cased and truncated, never carried whole.
pub const DEFAULT_HEADER_WHITELIST: &[&str] = &[
    "content-type",
    "accept",
    "x-request-id",
    "x-forwarded-for",
    "x-real-ip",
    "authorization",
    "openai-beta",
];

/// Truncates an `Authorization` header value to 10 chars + an ellipsis,
/// per the gateway's header-sanitization contract (spec.md §3, P10).
pub fn sanitize_authorization(value: &str) -> String {
    let truncated: String = value.chars().take(10).collect();
    format!("{truncated}…")
}
