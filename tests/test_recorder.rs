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

#[cfg(test)]
mod tests {
    use poolgate::domain::{ErrorLog, UsageLog, UsageTokens};
    use poolgate::recorder::{record_error, record_usage};
    use poolgate::store::{GatewayStore, InMemoryStore};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn success_path_persists_a_usage_row() {
        let store = Arc::new(InMemoryStore::new());
        let log = UsageLog {
            request_id: "req-1".to_string(),
            user_id: "u1".to_string(),
            account_id: "a1".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            stream: true,
            user_agent: "test-agent".to_string(),
            client_ip: "127.0.0.1".to_string(),
            duration_ms: 120,
            usage: UsageTokens {
                input_tokens: 1000,
                output_tokens: 500,
                cache_creation_input_tokens: 600,
                cache_read_input_tokens: 400,
            },
            recorded_at: chrono::Utc::now(),
        };
        let dyn_store: Arc<dyn GatewayStore> = store.clone();
        record_usage(dyn_store, log, Duration::from_secs(1));
        // Give the detached task a chance to run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.usage_logs.contains_key("req-1"));
    }

    #[tokio::test]
    async fn error_path_persists_an_error_row() {
        let store = Arc::new(InMemoryStore::new());
        let log = ErrorLog {
            request_id: "req-2".to_string(),
            user_id: Some("u1".to_string()),
            is_error: true,
            error_type: "upstream_error".to_string(),
            status_code: 503,
            message: "failover exhausted".to_string(),
            error_body: "{}".to_string(),
            headers_snapshot: vec![],
            upstream_status_code: Some(529),
            upstream_message: None,
            sse_errors: vec![],
            recorded_at: chrono::Utc::now(),
        };
        let dyn_store: Arc<dyn GatewayStore> = store.clone();
        record_error(dyn_store, log, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.error_logs.contains_key("req-2"));
    }
}
