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

//! Usage Recorder (spec.md §4.G): builds and persists success/error records
//! off the request path, on a detached context with its own timeout. Never
//! calls back into the request path; a failure here does not affect the
//! client response (spec.md §7 "The Recorder is best-effort").

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{ErrorLog, UsageLog};
use crate::store::GatewayStore;

/// Spawns the success path: persists one `UsageLog` row. Detached from the
/// request's lifetime — the caller does not await this.
pub fn record_usage(store: Arc<dyn GatewayStore>, log: UsageLog, timeout: Duration) {
    tokio::spawn(async move {
        let request_id = log.request_id.clone();
        match tokio::time::timeout(timeout, store.record_usage(log)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("failed to persist usage log for request '{request_id}': {e}");
            }
            Err(_) => {
                tracing::warn!("usage log write for request '{request_id}' timed out");
            }
        }
    });
}

/// Spawns the failure path: persists one `ErrorLog` row.
pub fn record_error(store: Arc<dyn GatewayStore>, log: ErrorLog, timeout: Duration) {
    tokio::spawn(async move {
        let request_id = log.request_id.clone();
        match tokio::time::timeout(timeout, store.record_error(log)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("failed to persist error log for request '{request_id}': {e}");
            }
            Err(_) => {
                tracing::warn!("error log write for request '{request_id}' timed out");
            }
        }
    });
}
