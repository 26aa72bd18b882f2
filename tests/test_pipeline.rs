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

//! End-to-end coverage of the Forwarder and Failover Loop against a real
//! (loopback) HTTP server standing in for an upstream provider, exercising
//! spec.md §8 scenarios 2, 3 and 5 across real sockets rather than just the
//! pure functions each module unit-tests in isolation.

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::Response;
    use axum::routing::post;
    use axum::Router;

    use poolgate::concurrency::{ConcurrencyController, RequestCancellation};
    use poolgate::domain::Account;
    use poolgate::error::ForwardOutcome;
    use poolgate::failover::{self, FailoverOptions};
    use poolgate::forwarder::{FixedTransferSource, ForwardRequest, TransferPlan, forward};

    /// Binds an axum server on an ephemeral loopback port that always answers
    /// with a fixed status/body/content-type, standing in for an upstream
    /// provider account.
    async fn spawn_mock(status: u16, body: String, content_type: &'static str) -> SocketAddr {
        let app = Router::new().route(
            "/",
            post(move || {
                let body = body.clone();
                async move {
                    Response::builder()
                        .status(StatusCode::from_u16(status).unwrap())
                        .header("content-type", content_type)
                        .body(Body::from(body))
                        .unwrap()
                }
            }),
        );
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let server = axum::Server::bind(&addr).serve(app.into_make_service());
        let bound_addr = server.local_addr();
        tokio::spawn(server);
        bound_addr
    }

    fn account(id: &str, base_url: String) -> Account {
        Account {
            account_id: id.to_string(),
            name: id.to_string(),
            group_id: "g1".to_string(),
            healthy: true,
            max_concurrency: 5,
            base_url,
            credential: "secret".to_string(),
            supported_models: vec!["claude-3-5-sonnet-20241022".to_string()],
        }
    }

    /// Scenario 2 (spec.md §8): a non-streaming upstream response carrying a
    /// usage block is rewritten according to the transfer plan, and the same
    /// rewritten values are what the Recorder would see via `ForwardResult`.
    #[tokio::test]
    async fn scenario_unary_forward_rewrites_usage_when_gated() {
        let upstream_body = serde_json::json!({
            "model": "claude-3-5-sonnet-20241022",
            "usage": {
                "input_tokens": 1000,
                "output_tokens": 500,
                "cache_creation_input_tokens": 200,
                "cache_read_input_tokens": 800
            }
        })
        .to_string();
        let addr = spawn_mock(200, upstream_body, "application/json").await;

        let acct = account("a1", format!("http://{addr}"));
        let plan = TransferPlan::new(0.5, 1.0, &FixedTransferSource(true));
        let req = ForwardRequest {
            account: &acct,
            body: b"{}".to_vec(),
            forward_headers: HeaderMap::new(),
            want_stream: false,
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            plan,
            model_requested: "claude-3-5-sonnet-20241022".to_string(),
        };

        match forward(req).await {
            ForwardOutcome::Success(delivery) => {
                let body_bytes = hyper::body::to_bytes(delivery.response.into_body())
                    .await
                    .unwrap();
                let parsed: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();
                assert_eq!(parsed["usage"]["cache_creation_input_tokens"], 600);
                assert_eq!(parsed["usage"]["cache_read_input_tokens"], 400);

                let result = delivery.completion.await;
                assert_eq!(result.usage.cache_creation_input_tokens, 600);
                assert_eq!(result.usage.cache_read_input_tokens, 400);
                assert_eq!(result.status, 200);
            }
            ForwardOutcome::FailoverNeeded { status } => {
                panic!("unexpected failover, status {status}")
            }
            ForwardOutcome::Terminal(e) => panic!("unexpected terminal error: {e}"),
        }
    }

    /// Scenario 3 (spec.md §8): with the probability gate closed, the client
    /// sees the untransformed usage block and `ForwardResult` stores the same
    /// untransformed values.
    #[tokio::test]
    async fn scenario_unary_forward_leaves_usage_untouched_when_not_gated() {
        let upstream_body = serde_json::json!({
            "model": "claude-3-5-sonnet-20241022",
            "usage": {
                "input_tokens": 1000,
                "output_tokens": 500,
                "cache_creation_input_tokens": 200,
                "cache_read_input_tokens": 800
            }
        })
        .to_string();
        let addr = spawn_mock(200, upstream_body, "application/json").await;

        let acct = account("a1", format!("http://{addr}"));
        let plan = TransferPlan::new(0.5, 0.0, &FixedTransferSource(false));
        let req = ForwardRequest {
            account: &acct,
            body: b"{}".to_vec(),
            forward_headers: HeaderMap::new(),
            want_stream: false,
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            plan,
            model_requested: "claude-3-5-sonnet-20241022".to_string(),
        };

        match forward(req).await {
            ForwardOutcome::Success(delivery) => {
                let result = delivery.completion.await;
                assert_eq!(result.usage.cache_creation_input_tokens, 200);
                assert_eq!(result.usage.cache_read_input_tokens, 800);
            }
            ForwardOutcome::FailoverNeeded { status } => {
                panic!("unexpected failover, status {status}")
            }
            ForwardOutcome::Terminal(e) => panic!("unexpected terminal error: {e}"),
        }
    }

    /// Scenario 2's streaming variant: the `message_start` usage block is
    /// rewritten in the forwarded SSE bytes, and the trailing `message_delta`
    /// carries the accumulated cache split forward untouched.
    #[tokio::test]
    async fn scenario_stream_forward_rewrites_message_start_and_carries_usage_forward() {
        let sse_body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-3-5-sonnet-20241022\",",
            "\"usage\":{\"input_tokens\":1000,\"output_tokens\":0,",
            "\"cache_creation_input_tokens\":200,\"cache_read_input_tokens\":800}}}\n\n",
            "event: message_delta\n",
            "data: {\"usage\":{\"output_tokens\":500}}\n\n",
            "event: message_stop\n",
            "data: {}\n\n",
        )
        .to_string();
        let addr = spawn_mock(200, sse_body, "text/event-stream").await;

        let acct = account("a1", format!("http://{addr}"));
        let plan = TransferPlan::new(0.5, 1.0, &FixedTransferSource(true));
        let req = ForwardRequest {
            account: &acct,
            body: b"{}".to_vec(),
            forward_headers: HeaderMap::new(),
            want_stream: true,
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            plan,
            model_requested: "claude-3-5-sonnet-20241022".to_string(),
        };

        match forward(req).await {
            ForwardOutcome::Success(delivery) => {
                let body_bytes = hyper::body::to_bytes(delivery.response.into_body())
                    .await
                    .unwrap();
                let text = String::from_utf8(body_bytes.to_vec()).unwrap();
                assert!(text.contains("\"cache_creation_input_tokens\":600"));
                assert!(text.contains("\"cache_read_input_tokens\":400"));
                assert!(text.contains("event: message_start"));
                assert!(text.contains("event: message_delta"));

                let result = delivery.completion.await;
                assert_eq!(result.usage.cache_creation_input_tokens, 600);
                assert_eq!(result.usage.cache_read_input_tokens, 400);
                assert_eq!(result.usage.output_tokens, 500);
            }
            ForwardOutcome::FailoverNeeded { status } => {
                panic!("unexpected failover, status {status}")
            }
            ForwardOutcome::Terminal(e) => panic!("unexpected terminal error: {e}"),
        }
    }

    /// Scenario 5 (spec.md §8): a 529 from one account triggers failover to
    /// the next healthy candidate rather than surfacing an error, regardless
    /// of which of the two accounts the Selector tries first.
    #[tokio::test]
    async fn scenario_failover_switches_past_an_overloaded_account() {
        let overloaded_body = serde_json::json!({
            "error": { "type": "overloaded_error", "message": "upstream overloaded" }
        })
        .to_string();
        let bad_addr = spawn_mock(529, overloaded_body, "application/json").await;

        let ok_body = serde_json::json!({
            "model": "claude-3-5-sonnet-20241022",
            "usage": {
                "input_tokens": 10,
                "output_tokens": 5,
                "cache_creation_input_tokens": 0,
                "cache_read_input_tokens": 0
            }
        })
        .to_string();
        let good_addr = spawn_mock(200, ok_body, "application/json").await;

        let controller = ConcurrencyController::new();
        let accounts = vec![
            account("bad", format!("http://{bad_addr}")),
            account("good", format!("http://{good_addr}")),
        ];

        let opts = FailoverOptions {
            group_id: "g1".to_string(),
            session_hash: String::new(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            max_switches: 3,
            account_wait_timeout: Duration::from_secs(2),
            ping_interval: None,
            heartbeat: None,
            stream_started: Arc::new(AtomicBool::new(false)),
            cancellation: RequestCancellation::new(),
        };

        let plan = TransferPlan::new(0.0, 0.0, &FixedTransferSource(false));
        let success = failover::run(
            &controller,
            &accounts,
            opts,
            move || {
                (
                    br#"{"model":"claude-3-5-sonnet-20241022"}"#.to_vec(),
                    HeaderMap::new(),
                    false,
                    plan,
                )
            },
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .await
        .expect("failover should land on the healthy account");

        assert_eq!(success.account.account_id, "good");
        let result = success.delivery.completion.await;
        assert_eq!(result.status, 200);
    }
}
