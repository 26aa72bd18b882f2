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

//! Failover Loop (spec.md §4.F): orchestrates the Account Selector, the
//! Concurrency Controller's account-level admission, and the Forwarder
//! across multiple account candidates for one request.

use std::sync::Arc;
use std::time::Duration;

use crate::concurrency::{
    AcquireOptions, ConcurrencyController, Heartbeat, RequestCancellation, ScopeKind, StreamStarted,
};
use crate::domain::Account;
use crate::error::{ForwardOutcome, GatewayError};
use crate::forwarder::{self, ForwardDelivery, ForwardRequest, TransferPlan};
use crate::selector::{self, Selection};

pub struct FailoverOptions {
    pub group_id: String,
    pub session_hash: String,
    pub model: String,
    pub max_switches: u32,
    pub account_wait_timeout: Duration,
    pub ping_interval: Option<Duration>,
    pub heartbeat: Option<Arc<dyn Heartbeat>>,
    pub stream_started: StreamStarted,
    pub cancellation: RequestCancellation,
}

pub struct FailoverSuccess {
    pub account: Account,
    pub delivery: ForwardDelivery,
}

/// Runs the Failover Loop: select an account, admit it against the
/// concurrency controller, forward the request; on a retryable upstream
/// failure mark the account failed-for-this-request and try the next one,
/// up to `max_switches` additional attempts (spec.md §4.F, P8, I5).
pub async fn run(
    controller: &ConcurrencyController,
    accounts: &[Account],
    opts: FailoverOptions,
    make_body: impl Fn() -> (Vec<u8>, axum::http::HeaderMap, bool, TransferPlan) + Send + Sync,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<FailoverSuccess, GatewayError> {
    let mut switches: u32 = 0;
    let mut failed: Vec<String> = Vec::new();
    let mut last_status: u16 = 502;

    loop {
        let selection = selector::select(
            controller,
            &opts.group_id,
            &opts.session_hash,
            &opts.model,
            accounts,
            &failed,
        )
        .map_err(|e| {
            if failed.is_empty() {
                e
            } else {
                GatewayError::UpstreamExhausted(last_status)
            }
        })?;

        let (account, guard) = match selection {
            Selection::Acquired { account, guard } => (account, guard),
            Selection::WaitPlan { account } => {
                let guard = controller
                    .acquire_slot_with_wait(
                        ScopeKind::Account,
                        &account.account_id,
                        AcquireOptions {
                            max_active: account.max_concurrency,
                            wait_timeout: opts.account_wait_timeout,
                            is_streaming: opts.ping_interval.is_some(),
                            ping_interval: opts.ping_interval,
                            heartbeat: opts.heartbeat.clone(),
                            stream_started: opts.stream_started.clone(),
                            cancellation: opts.cancellation.clone(),
                        },
                    )
                    .await?;
                selector::bind_after_wait(&opts.group_id, &opts.session_hash, &account.account_id);
                (account, guard)
            }
        };

        let (body, forward_headers, want_stream, plan) = make_body();
        let result = forwarder::forward(ForwardRequest {
            account: &account,
            body,
            forward_headers,
            want_stream,
            connect_timeout,
            read_timeout,
            plan,
            model_requested: opts.model.clone(),
            stream_started: opts.stream_started.clone(),
        })
        .await;

        // The account slot is released as soon as forwarding for this
        // attempt is decided; the user slot (held by the outer caller)
        // stays held across switches (spec.md §7 propagation policy).
        drop(guard);

        match result {
            ForwardOutcome::Success(delivery) => {
                return Ok(FailoverSuccess { account, delivery });
            }
            ForwardOutcome::FailoverNeeded { status } => {
                failed.push(account.account_id.clone());
                last_status = status;
                switches += 1;
                if switches > opts.max_switches {
                    return Err(GatewayError::UpstreamExhausted(last_status));
                }
                continue;
            }
            ForwardOutcome::Terminal(err) => {
                return Err(err);
            }
        }
    }
}
