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

//! Gateway-wide error type. Every failure path the core can take collapses
//! into one `GatewayError`, which knows the HTTP status and dialect-neutral
//! `error_type` string recorded verbatim in `ErrorLog.error_type` (spec.md §7).

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    #[error("wait queue full")]
    QueueFull,
    #[error("timed out waiting for a concurrency slot")]
    SlotTimeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("billing ineligible: {0}")]
    Billing(String),
    #[error("no account available for model '{0}'")]
    NoAccount(String),
    #[error("upstream failover exhausted, last status {0}")]
    UpstreamExhausted(u16),
    #[error("forward error: {0}")]
    Forward(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("payload too large")]
    PayloadTooLarge,
}

impl GatewayError {
    /// HTTP status returned to the client for this error kind.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::QueueFull | GatewayError::SlotTimeout | GatewayError::Cancelled => 429,
            GatewayError::Billing(_) => 402,
            GatewayError::NoAccount(_) => 503,
            GatewayError::UpstreamExhausted(status) => map_upstream_status(*status),
            GatewayError::Forward(_) => 502,
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::PayloadTooLarge => 413,
        }
    }

    /// `error_type` recorded verbatim in `ErrorLog` and used by the Error
    /// Shaper to pick the dialect-specific body (spec.md §7).
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::QueueFull | GatewayError::SlotTimeout | GatewayError::Cancelled => {
                "concurrency_limit"
            }
            GatewayError::Billing(_) => "billing_error",
            GatewayError::NoAccount(_) => "no_account",
            GatewayError::UpstreamExhausted(_) => "upstream_error",
            GatewayError::Forward(_) => "forward_error",
            GatewayError::InvalidRequest(_) | GatewayError::PayloadTooLarge => {
                "invalid_request_error"
            }
        }
    }
}

/// Maps an upstream status observed during failover to the status returned
/// to the client once failover is exhausted (spec.md §4.H).
pub fn map_upstream_status(upstream: u16) -> u16 {
    match upstream {
        401 | 403 => 502,
        429 => 429,
        500 | 502 | 503 | 504 | 529 => 503,
        _ => 502,
    }
}

/// Errors the Forwarder can return from a single attempt against one
/// account, distinguishing retryable upstream failures from terminal ones
/// (spec.md §9, tagged-variant design note).
#[derive(Debug, Clone)]
pub enum ForwardOutcome<T> {
    Success(T),
    FailoverNeeded { status: u16 },
    Terminal(GatewayError),
}
