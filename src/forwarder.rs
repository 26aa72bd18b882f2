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

//! Forwarder (spec.md §4.E): streams or buffers the upstream response,
//! intercepts the usage block, and classifies upstream errors for
//! failover. Egress is `reqwest` with `rustls-tls` — the teacher's bare
//! `hyper::Client<HttpConnector>` has no TLS and cannot reach HTTPS
//! provider endpoints, so this is the one seam where the crate reaches
//! past the teacher into the rest of the retrieval pack (see DESIGN.md).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::concurrency::StreamStarted;
use crate::domain::{Account, UsageTokens};
use crate::error::GatewayError;
use crate::transfer;

pub use crate::error::ForwardOutcome;

/// Upstream statuses that trigger failover to another account (spec.md
/// §4.E). Any other non-2xx status is a terminal, non-retryable client
/// error forwarded to the caller verbatim.
pub const FAILOVER_STATUSES: &[u16] = &[401, 403, 429, 500, 502, 503, 504, 529];

pub fn is_failover_status(status: u16) -> bool {
    FAILOVER_STATUSES.contains(&status)
}

/// Headers never copied onto the outbound upstream request: hop-by-hop
/// framing headers and the inbound gateway credential, which is replaced
/// by the account's own.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "authorization",
    "x-api-key",
    "connection",
];

static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .pool_max_idle_per_host(32)
        .build()
        .expect("failed to build upstream HTTP client")
});

/// Gate decision plus ratio for one request; computed once and applied
/// identically at every usage-bearing site within the response (spec.md
/// I3 — the probability gate must not be re-sampled per SSE event).
#[derive(Debug, Clone, Copy)]
pub struct TransferPlan {
    pub ratio: f64,
    pub gate: bool,
}

impl TransferPlan {
    pub fn new(ratio: f64, prob: f64, source: &dyn TransferSource) -> Self {
        Self {
            ratio,
            gate: source.should_transfer(prob),
        }
    }

    pub fn apply(&self, cache_creation: u64, cache_read: u64) -> (u64, u64) {
        if self.gate {
            transfer::transfer(cache_creation, cache_read, self.ratio)
        } else {
            (cache_creation, cache_read)
        }
    }
}

/// Injectable source for the probability gate (spec.md §9 "Probability
/// source" design note): production uses the process-wide thread RNG;
/// tests inject a deterministic source.
pub trait TransferSource: Send + Sync {
    fn should_transfer(&self, prob: f64) -> bool;
}

pub struct ThreadRngTransferSource;

impl TransferSource for ThreadRngTransferSource {
    fn should_transfer(&self, prob: f64) -> bool {
        let mut rng = rand::thread_rng();
        transfer::should_transfer(prob, &mut rng)
    }
}

/// Captured during forwarding; consumed by the Recorder and included in
/// the ErrorLog path (spec.md §3 `ForwardResult`).
#[derive(Debug, Clone, Default)]
pub struct ForwardResult {
    pub status: u16,
    pub usage: UsageTokens,
    pub model: String,
    pub upstream_request_id: Option<String>,
    pub duration: Duration,
    pub upstream_errors: Vec<String>,
}

pub type CompletionFuture = Pin<Box<dyn Future<Output = ForwardResult> + Send>>;

/// What the Forwarder hands back on a non-failover outcome: a response
/// ready to return to the client, and a future resolving to the final
/// `ForwardResult` once it is fully known (immediately, for the buffered
/// path; at stream end, for SSE).
pub struct ForwardDelivery {
    pub response: Response,
    pub completion: CompletionFuture,
}

pub struct ForwardRequest<'a> {
    pub account: &'a Account,
    pub body: Vec<u8>,
    pub forward_headers: HeaderMap,
    pub want_stream: bool,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub plan: TransferPlan,
    pub model_requested: String,
    pub stream_started: StreamStarted,
}

/// Issues the upstream request and classifies the outcome (spec.md
/// §4.E). Connection failures before any bytes are read are treated the
/// same as the provider-side failover statuses.
pub async fn forward(req: ForwardRequest<'_>) -> ForwardOutcome<ForwardDelivery> {
    let start = Instant::now();
    let url = format!(
        "{}{}",
        req.account.base_url.trim_end_matches('/'),
        upstream_path(req.want_stream)
    );

    let mut builder = HTTP_CLIENT
        .post(&url)
        .timeout(req.read_timeout)
        .header("Authorization", format!("Bearer {}", req.account.credential))
        .header("x-api-key", req.account.credential.clone())
        .header("Content-Type", "application/json");

    for (name, value) in req.forward_headers.iter() {
        if STRIPPED_REQUEST_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name.clone(), value.clone());
    }

    let connect_fut = builder.body(req.body).send();
    let sent = match tokio::time::timeout(req.connect_timeout + req.read_timeout, connect_fut).await
    {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            tracing::warn!("upstream request to '{}' failed: {e}", req.account.account_id);
            return ForwardOutcome::FailoverNeeded { status: 0 };
        }
        Err(_) => {
            tracing::warn!("upstream request to '{}' timed out", req.account.account_id);
            return ForwardOutcome::FailoverNeeded { status: 0 };
        }
    };

    let status = sent.status().as_u16();
    let upstream_request_id = sent
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if is_failover_status(status) {
        // Drain the body so the connection can be reused by the pool.
        let _ = sent.bytes().await;
        return ForwardOutcome::FailoverNeeded { status };
    }

    if req.want_stream && sent.status().is_success() {
        return handle_stream(
            sent,
            status,
            upstream_request_id,
            start,
            req.plan,
            req.model_requested,
            req.stream_started,
        )
        .await;
    }

    handle_buffered(sent, status, upstream_request_id, start, req.plan, req.model_requested).await
}

fn upstream_path(_want_stream: bool) -> &'static str {
    // The account's base_url already addresses the provider's API root;
    // the core forwards to the single dialect endpoint the account was
    // resolved for. Concrete per-dialect suffixes are owned by the
    // ingress router's account base_url configuration.
    ""
}

async fn handle_buffered(
    resp: reqwest::Response,
    status: u16,
    upstream_request_id: Option<String>,
    start: Instant,
    plan: TransferPlan,
    model_requested: String,
) -> ForwardOutcome<ForwardDelivery> {
    let upstream_headers = resp.headers().clone();
    let bytes = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            return ForwardOutcome::Terminal(GatewayError::Forward(format!(
                "failed to read upstream response body: {e}"
            )));
        }
    };

    let mut usage = UsageTokens::default();
    let mut model = model_requested.clone();
    let mut upstream_errors = Vec::new();

    let rewritten_body: Vec<u8> = match serde_json::from_slice::<Value>(&bytes) {
        Ok(mut parsed) => {
            if let Some(m) = parsed.get("model").and_then(Value::as_str) {
                model = m.to_string();
            }
            if let Some(err_obj) = parsed.get("error") {
                upstream_errors.push(err_obj.to_string());
            }
            if let Some(usage_value) = parsed.get_mut("usage") {
                usage = extract_usage(usage_value);
                let (cc2, cr2) = plan.apply(
                    usage.cache_creation_input_tokens,
                    usage.cache_read_input_tokens,
                );
                usage.cache_creation_input_tokens = cc2;
                usage.cache_read_input_tokens = cr2;
                write_usage(usage_value, &usage);
            }
            serde_json::to_vec(&parsed).unwrap_or_else(|_| bytes.to_vec())
        }
        Err(e) => {
            tracing::warn!("upstream response was not valid JSON: {e}");
            bytes.to_vec()
        }
    };

    let result = ForwardResult {
        status,
        usage,
        model,
        upstream_request_id,
        duration: start.elapsed(),
        upstream_errors,
    };

    let mut response_builder = Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    copy_response_headers(&upstream_headers, response_builder.headers_mut().unwrap());
    let response = response_builder
        .body(Body::from(rewritten_body))
        .expect("building a response from buffered bytes cannot fail");

    ForwardOutcome::Success(ForwardDelivery {
        response,
        completion: Box::pin(async move { result }),
    })
}

async fn handle_stream(
    resp: reqwest::Response,
    status: u16,
    upstream_request_id: Option<String>,
    start: Instant,
    plan: TransferPlan,
    model_requested: String,
    stream_started: StreamStarted,
) -> ForwardOutcome<ForwardDelivery> {
    let upstream_headers = resp.headers().clone();
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let (done_tx, done_rx) = oneshot::channel::<ForwardResult>();

    tokio::spawn(async move {
        let mut event_stream = resp.bytes_stream().eventsource();
        let mut usage = UsageTokens::default();
        let mut model = model_requested.clone();
        let mut upstream_errors = Vec::new();
        let mut forwarded_first_byte = false;

        while let Some(event_result) = event_stream.next().await {
            let event = match event_result {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("SSE stream error: {e}");
                    break;
                }
            };

            let frame = match event.event.as_str() {
                "message_start" => {
                    rewrite_message_start(&event.data, &plan, &mut usage, &mut model)
                        .unwrap_or_else(|| event.data.clone())
                }
                "message_delta" => rewrite_message_delta(&event.data, &plan, &mut usage)
                    .unwrap_or_else(|| event.data.clone()),
                "error" => {
                    upstream_errors.push(event.data.clone());
                    event.data.clone()
                }
                _ => event.data.clone(),
            };

            let sse_frame = format!("event: {}\ndata: {}\n\n", event.event, frame);
            if tx.send(Ok(Bytes::from(sse_frame))).await.is_err() {
                // Client disconnected; stop reading from upstream.
                break;
            }
            if !forwarded_first_byte {
                stream_started.mark();
                forwarded_first_byte = true;
            }
        }

        let _ = done_tx.send(ForwardResult {
            status,
            usage,
            model,
            upstream_request_id,
            duration: start.elapsed(),
            upstream_errors,
        });
    });

    let body = Body::wrap_stream(ReceiverStream::new(rx));
    let mut response_builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache");
    copy_response_headers(&upstream_headers, response_builder.headers_mut().unwrap());
    let response = response_builder
        .body(body)
        .expect("building a streamed response cannot fail");

    let completion: CompletionFuture = Box::pin(async move {
        done_rx.await.unwrap_or_default()
    });

    ForwardOutcome::Success(ForwardDelivery { response, completion })
}

/// Decodes a `message_start` event's `message.usage`, applies the
/// transfer plan against it, and re-encodes the event data byte-for-byte
/// except for the rewritten usage fields (spec.md §4.E, P9).
pub fn rewrite_message_start(
    data: &str,
    plan: &TransferPlan,
    usage_out: &mut UsageTokens,
    model_out: &mut String,
) -> Option<String> {
    let mut parsed: Value = serde_json::from_str(data).ok()?;
    if let Some(m) = parsed
        .get("message")
        .and_then(|m| m.get("model"))
        .and_then(Value::as_str)
    {
        *model_out = m.to_string();
    }
    let usage_value = parsed.get_mut("message")?.get_mut("usage")?;
    *usage_out = extract_usage(usage_value);
    let (cc2, cr2) = plan.apply(
        usage_out.cache_creation_input_tokens,
        usage_out.cache_read_input_tokens,
    );
    usage_out.cache_creation_input_tokens = cc2;
    usage_out.cache_read_input_tokens = cr2;
    write_usage(usage_value, usage_out);
    serde_json::to_string(&parsed).ok()
}

/// Decodes a trailing `message_delta` event's `usage` (carrying
/// `output_tokens`, and on some providers a refreshed cache split),
/// applying the same rewrite using values accumulated so far.
pub fn rewrite_message_delta(data: &str, plan: &TransferPlan, usage_out: &mut UsageTokens) -> Option<String> {
    let mut parsed: Value = serde_json::from_str(data).ok()?;
    let usage_value = parsed.get_mut("usage")?;
    if let Some(out) = usage_value.get("output_tokens").and_then(Value::as_u64) {
        usage_out.output_tokens = out;
    }
    let has_cache_fields = usage_value.get("cache_creation_input_tokens").is_some()
        || usage_value.get("cache_read_input_tokens").is_some();
    if has_cache_fields {
        let incoming = extract_usage(usage_value);
        let (cc2, cr2) = plan.apply(
            incoming.cache_creation_input_tokens,
            incoming.cache_read_input_tokens,
        );
        usage_out.cache_creation_input_tokens = cc2;
        usage_out.cache_read_input_tokens = cr2;
        write_usage(usage_value, usage_out);
    } else if let Some(obj) = usage_value.as_object_mut() {
        obj.insert(
            "output_tokens".to_string(),
            Value::from(usage_out.output_tokens),
        );
    }
    serde_json::to_string(&parsed).ok()
}

fn extract_usage(value: &Value) -> UsageTokens {
    UsageTokens {
        input_tokens: value.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: value.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
        cache_creation_input_tokens: value
            .get("cache_creation_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cache_read_input_tokens: value
            .get("cache_read_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    }
}

fn write_usage(value: &mut Value, usage: &UsageTokens) {
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "cache_creation_input_tokens".to_string(),
            Value::from(usage.cache_creation_input_tokens),
        );
        obj.insert(
            "cache_read_input_tokens".to_string(),
            Value::from(usage.cache_read_input_tokens),
        );
    }
}

fn copy_response_headers(from: &reqwest::header::HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from.iter() {
        if name.as_str().eq_ignore_ascii_case("transfer-encoding")
            || name.as_str().eq_ignore_ascii_case("content-length")
            || name.as_str().eq_ignore_ascii_case("connection")
        {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            to.insert(n, v);
        }
    }
}

/// Used by unit tests that need a deterministic, always-on or always-off
/// transfer gate without pulling in `rand`.
pub struct FixedTransferSource(pub bool);

impl TransferSource for FixedTransferSource {
    fn should_transfer(&self, _prob: f64) -> bool {
        self.0
    }
}
