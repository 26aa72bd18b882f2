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

// ----------------------
// External dependencies
// ----------------------
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Router, body::Body};
use std::net::SocketAddr;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use poolgate::auth::{Authenticator, InMemoryAuthenticator};
use poolgate::concurrency::{
    AcquireOptions, ConcurrencyController, Heartbeat, RequestCancellation, ScopeKind, StreamStarted,
};
use poolgate::config::{CONFIG, Config};
use poolgate::domain::{ErrorLog, UsageLog, sanitize_authorization};
use poolgate::error::GatewayError;
use poolgate::failover::{self, FailoverOptions, FailoverSuccess};
use poolgate::forwarder::{self, ThreadRngTransferSource, TransferPlan};
use poolgate::preflight::{Dialect, PreflightResult, preflight};
use poolgate::recorder;
use poolgate::selector::derive_session_hash;
use poolgate::shaper;
use poolgate::store::{GatewayStore, InMemoryStore};
use poolgate::transfer::effective;

/// ----------------------------
/// CLI ARGUMENT STRUCTURE
/// ----------------------------
#[derive(Parser, Debug)]
#[command(
    name = "poolgate",
    version = "0.1.0",
    about = "API gateway that multiplexes end-user API keys onto a pool of upstream LLM provider accounts"
)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: String,
}

fn init_logging(app_id: &str) {
    let filter = EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("logging initialized for app_id: {app_id}");
}

/// Shared state handed to every traffic-router handler.
struct AppState {
    store: Arc<dyn GatewayStore>,
    authenticator: Arc<dyn Authenticator>,
    controller: Arc<ConcurrencyController>,
}

/// Streams an SSE comment-line ping into the client connection while the
/// user- or account-level admission wait is in progress (spec.md §4.A).
struct ChannelHeartbeat {
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
}

#[async_trait]
impl Heartbeat for ChannelHeartbeat {
    async fn ping(&self) {
        let _ = self.tx.send(Ok(Bytes::from_static(b": ping\n\n"))).await;
    }
}

async fn responses_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_request(state, Dialect::Responses, headers, body).await
}

async fn messages_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_request(state, Dialect::Messages, headers, body).await
}

/// Shared ingress pipeline for both dialect routes (spec.md §2 control
/// flow, `[ADD]`): Auth Gate → Preflight → admit-user → Failover Loop →
/// Usage Recorder.
async fn handle_request(
    state: Arc<AppState>,
    dialect: Dialect,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let cfg = CONFIG.get().expect("CONFIG must be initialized");
    let start = Instant::now();
    let request_id = uuid::Uuid::new_v4().to_string();

    let client_ip = headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let auth_header = headers.get("authorization").and_then(|v| v.to_str().ok());
    let auth = match state.authenticator.authenticate(auth_header).await {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!("authentication failed: {e}");
            return shaper::into_response(
                dialect,
                &GatewayError::InvalidRequest(format!("authentication failed: {e}")),
            );
        }
    };

    let preflight_result = match preflight(
        dialect,
        &body,
        Some(&user_agent),
        cfg.gateway.body_max_bytes,
        &cfg.gateway.default_instructions,
    ) {
        Ok(r) => r,
        Err(err) => {
            record_error_log(
                &state,
                cfg,
                &request_id,
                Some(auth.user_id.clone()),
                &err,
                &headers,
                None,
                None,
                vec![],
            );
            return shaper::into_response(dialect, &err);
        }
    };

    if preflight_result.stream {
        stream_response(
            state,
            cfg,
            dialect,
            auth,
            headers,
            preflight_result,
            request_id,
            client_ip,
            user_agent,
            start,
        )
        .await
    } else {
        unary_response(
            state,
            cfg,
            dialect,
            auth,
            headers,
            preflight_result,
            request_id,
            client_ip,
            user_agent,
            start,
        )
        .await
    }
}

/// Runs admission + failover for a non-streaming request and returns the
/// buffered client response directly.
async fn unary_response(
    state: Arc<AppState>,
    cfg: &'static Config,
    dialect: Dialect,
    auth: poolgate::auth::AuthContext,
    headers: HeaderMap,
    preflight_result: PreflightResult,
    request_id: String,
    client_ip: String,
    user_agent: String,
    start: Instant,
) -> Response {
    let stream_started = StreamStarted::new();
    let cancellation = RequestCancellation::new();

    match run_pipeline(
        &state,
        cfg,
        &auth,
        &headers,
        &preflight_result,
        None,
        stream_started,
        cancellation,
    )
    .await
    {
        Ok(FailoverSuccess { account, delivery }) => {
            let result = delivery.completion.await;
            record_usage_log(
                &state,
                cfg,
                &request_id,
                &auth,
                &account.account_id,
                &preflight_result,
                &result,
                &client_ip,
                &user_agent,
                start,
            );
            delivery.response
        }
        Err(err) => {
            record_error_log(
                &state,
                cfg,
                &request_id,
                Some(auth.user_id.clone()),
                &err,
                &headers,
                None,
                None,
                vec![],
            );
            shaper::into_response(dialect, &err)
        }
    }
}

/// What the pipeline task reports back to `stream_response` the moment it
/// is decided, one way or the other: either the client connection is
/// going to carry real output (success, or an error that struck after
/// output had already begun), or the request failed before anything was
/// emitted and should get the plain mapped-status response the
/// non-streaming path would produce instead (spec.md §4.H).
enum StreamDecision {
    Open,
    Failed(GatewayError),
}

/// Runs admission + failover for a streaming request. Response
/// construction is deferred until the pipeline reaches a decision point:
/// the first heartbeat or forwarded byte commits to the 200 SSE response
/// (spec.md §4.A, §4.H "Started" path); a `GatewayError` that strikes
/// before any output instead yields the mapped-status JSON body ("Not
/// started" path), exactly as `unary_response` would produce for the same
/// error.
async fn stream_response(
    state: Arc<AppState>,
    cfg: &'static Config,
    dialect: Dialect,
    auth: poolgate::auth::AuthContext,
    headers: HeaderMap,
    preflight_result: PreflightResult,
    request_id: String,
    client_ip: String,
    user_agent: String,
    start: Instant,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let stream_started = StreamStarted::new();
    let cancellation = RequestCancellation::new();
    let heartbeat: Arc<dyn Heartbeat> = Arc::new(ChannelHeartbeat { tx: tx.clone() });
    let (decision_tx, decision_rx) = oneshot::channel::<StreamDecision>();

    let task_stream_started = stream_started.clone();
    tokio::spawn(async move {
        let outcome = run_pipeline(
            &state,
            cfg,
            &auth,
            &headers,
            &preflight_result,
            Some(heartbeat),
            task_stream_started.clone(),
            cancellation,
        )
        .await;

        match outcome {
            Ok(FailoverSuccess { account, delivery }) => {
                let _ = decision_tx.send(StreamDecision::Open);
                let mut inner = delivery.response.into_body();
                while let Some(chunk) = inner.next().await {
                    match chunk {
                        Ok(bytes) => {
                            if tx.send(Ok(bytes)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("error reading upstream stream body: {e}");
                            break;
                        }
                    }
                }
                let result = delivery.completion.await;
                record_usage_log(
                    &state,
                    cfg,
                    &request_id,
                    &auth,
                    &account.account_id,
                    &preflight_result,
                    &result,
                    &client_ip,
                    &user_agent,
                    start,
                );
            }
            Err(err) => {
                if task_stream_started.is_started() {
                    let frame = shaper::sse_error_frame(err.error_type(), &err.to_string());
                    let _ = tx.send(Ok(Bytes::from(frame))).await;
                    let _ = decision_tx.send(StreamDecision::Open);
                } else {
                    let _ = decision_tx.send(StreamDecision::Failed(err.clone()));
                }
                record_error_log(
                    &state,
                    cfg,
                    &request_id,
                    Some(auth.user_id.clone()),
                    &err,
                    &headers,
                    None,
                    None,
                    vec![],
                );
            }
        }
    });

    tokio::select! {
        _ = stream_started.wait() => build_sse_response(rx),
        decision = decision_rx => match decision {
            Ok(StreamDecision::Open) => build_sse_response(rx),
            Ok(StreamDecision::Failed(err)) => shaper::into_response(dialect, &err),
            Err(_) => shaper::into_response(
                dialect,
                &GatewayError::Forward("stream pipeline terminated unexpectedly".to_string()),
            ),
        },
    }
}

fn build_sse_response(rx: mpsc::Receiver<Result<Bytes, std::io::Error>>) -> Response {
    let body = Body::wrap_stream(ReceiverStream::new(rx));
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(body)
        .expect("building a streamed response cannot fail")
}

/// Admits the user (§4.A), then runs the Failover Loop (§4.F) against the
/// user's group accounts. Shared by both the unary and streaming paths.
async fn run_pipeline(
    state: &Arc<AppState>,
    cfg: &'static Config,
    auth: &poolgate::auth::AuthContext,
    headers: &HeaderMap,
    preflight_result: &PreflightResult,
    heartbeat: Option<Arc<dyn Heartbeat>>,
    stream_started: StreamStarted,
    cancellation: RequestCancellation,
) -> Result<FailoverSuccess, GatewayError> {
    let user = state
        .store
        .get_user(&auth.user_id)
        .await
        .map_err(|e| GatewayError::Billing(format!("unknown user: {e}")))?;

    let subscription = state
        .store
        .get_subscription(&auth.user_id)
        .await
        .unwrap_or(None);
    if let Some(sub) = &subscription {
        if !sub.active && !sub.allow_negative_balance && user.balance_cents <= 0 {
            return Err(GatewayError::Billing(
                "subscription inactive and balance exhausted".to_string(),
            ));
        }
    }

    let max_waiting = user.max_waiting();
    state
        .controller
        .increment_wait(ScopeKind::User, &auth.user_id, max_waiting)?;

    let ping_interval = if cfg.concurrency.ping_interval_seconds > 0 {
        Some(Duration::from_secs(cfg.concurrency.ping_interval_seconds))
    } else {
        None
    };

    let user_guard = state
        .controller
        .acquire_slot_with_wait(
            ScopeKind::User,
            &auth.user_id,
            AcquireOptions {
                max_active: user.concurrency,
                wait_timeout: Duration::from_secs(cfg.concurrency.slot_wait_timeout_seconds),
                is_streaming: preflight_result.stream,
                ping_interval,
                heartbeat: heartbeat.clone(),
                stream_started: stream_started.clone(),
                cancellation: cancellation.clone(),
            },
        )
        .await;
    state
        .controller
        .decrement_wait(ScopeKind::User, &auth.user_id);
    let user_guard = user_guard?;

    let group = state
        .store
        .get_group(&auth.group_id)
        .await
        .map_err(|e| GatewayError::NoAccount(format!("group lookup failed: {e}")))?;
    let accounts = state
        .store
        .get_accounts_for_group(&auth.group_id)
        .await
        .map_err(|e| GatewayError::NoAccount(format!("account lookup failed: {e}")))?;

    let session_hash = derive_session_hash(
        headers
            .get("x-session-id")
            .and_then(|v| v.to_str().ok()),
        preflight_result.prompt_cache_key.as_deref(),
    );

    let (ratio, prob) = effective(
        group.cache_read_transfer_ratio,
        group.cache_read_transfer_probability,
        user.cache_read_transfer_ratio,
        user.cache_read_transfer_probability,
    );

    let forward_headers = headers.clone();
    let model = preflight_result.model.clone();
    let want_stream = preflight_result.stream;
    let body = preflight_result.body.clone();

    let failover_opts = FailoverOptions {
        group_id: auth.group_id.clone(),
        session_hash,
        model: model.clone(),
        max_switches: cfg.max_account_switches,
        account_wait_timeout: Duration::from_secs(cfg.concurrency.slot_wait_timeout_seconds),
        ping_interval,
        heartbeat,
        stream_started,
        cancellation,
    };

    let result = failover::run(
        &state.controller,
        &accounts,
        failover_opts,
        move || {
            let plan = TransferPlan::new(ratio, prob, &ThreadRngTransferSource);
            (body.clone(), forward_headers.clone(), want_stream, plan)
        },
        Duration::from_secs(cfg.upstream.connect_timeout_secs),
        Duration::from_secs(cfg.upstream.read_timeout_secs),
    )
    .await;

    drop(user_guard);
    result
}

#[allow(clippy::too_many_arguments)]
fn record_usage_log(
    state: &Arc<AppState>,
    cfg: &'static Config,
    request_id: &str,
    auth: &poolgate::auth::AuthContext,
    account_id: &str,
    preflight_result: &PreflightResult,
    result: &forwarder::ForwardResult,
    client_ip: &str,
    user_agent: &str,
    start: Instant,
) {
    let log = UsageLog {
        request_id: request_id.to_string(),
        user_id: auth.user_id.clone(),
        account_id: account_id.to_string(),
        model: if result.model.is_empty() {
            preflight_result.model.clone()
        } else {
            result.model.clone()
        },
        stream: preflight_result.stream,
        user_agent: user_agent.to_string(),
        client_ip: client_ip.to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
        usage: result.usage,
        recorded_at: chrono::Utc::now(),
    };
    recorder::record_usage(
        state.store.clone(),
        log,
        Duration::from_secs(cfg.recorder_timeout_secs),
    );
}

#[allow(clippy::too_many_arguments)]
fn record_error_log(
    state: &Arc<AppState>,
    cfg: &'static Config,
    request_id: &str,
    user_id: Option<String>,
    err: &GatewayError,
    headers: &HeaderMap,
    upstream_status_code: Option<u16>,
    upstream_message: Option<String>,
    sse_errors: Vec<String>,
) {
    let headers_snapshot = capture_headers(headers, &cfg.header_whitelist);
    let log = ErrorLog {
        request_id: request_id.to_string(),
        user_id,
        is_error: true,
        error_type: err.error_type().to_string(),
        status_code: err.status_code(),
        message: err.to_string(),
        error_body: serde_json::to_string(&shaper::error_body(
            Dialect::Responses,
            err.error_type(),
            &err.to_string(),
        ))
        .unwrap_or_default(),
        headers_snapshot,
        upstream_status_code,
        upstream_message,
        sse_errors,
        recorded_at: chrono::Utc::now(),
    };
    recorder::record_error(
        state.store.clone(),
        log,
        Duration::from_secs(cfg.recorder_timeout_secs),
    );
}

/// Captures the whitelisted request headers into `ErrorLog.headers_snapshot`,
/// truncating `Authorization` per spec.md P10.
fn capture_headers(headers: &HeaderMap, whitelist: &[String]) -> Vec<(String, String)> {
    whitelist
        .iter()
        .filter_map(|name| {
            headers.get(name.as_str()).and_then(|v| v.to_str().ok()).map(|v| {
                let value = if name.eq_ignore_ascii_case("authorization") {
                    sanitize_authorization(v)
                } else {
                    v.to_string()
                };
                (name.clone(), value)
            })
        })
        .collect()
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    let args = Args::parse();

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load config from '{}': {e}", args.config);
            exit(1);
        }
    };

    init_logging(&config.app_id);

    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    CONFIG.set(config).expect("CONFIG was already initialized");
    let cfg = CONFIG.get().expect("CONFIG must be initialized");

    let state = Arc::new(AppState {
        store: Arc::new(InMemoryStore::new()),
        authenticator: Arc::new(InMemoryAuthenticator::new()),
        controller: Arc::new(ConcurrencyController::new()),
    });

    let traffic_router = Router::new()
        .route("/openai/v1/responses", post(responses_handler))
        .route("/v1/messages", post(messages_handler))
        .layer(DefaultBodyLimit::max(cfg.gateway.body_max_bytes))
        .with_state(state);

    let admin_router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(move || async move { handle.render() }))
        .layer(CorsLayer::permissive());

    let proxy_addr = SocketAddr::from(([0, 0, 0, 0], cfg.proxy_port));
    let admin_addr = SocketAddr::from(([0, 0, 0, 0], cfg.admin_port));

    info!("gateway listening at http://{}", proxy_addr);
    info!("admin/metrics listening at http://{}", admin_addr);

    let proxy_server = axum::Server::bind(&proxy_addr).serve(traffic_router.into_make_service());
    let admin_server = axum::Server::bind(&admin_addr).serve(admin_router.into_make_service());

    let (proxy_result, admin_result) = tokio::join!(proxy_server, admin_server);

    if let Err(e) = proxy_result {
        error!("gateway server exited with error: {}", e);
    }
    if let Err(e) = admin_result {
        error!("admin server exited with error: {}", e);
    }
}
