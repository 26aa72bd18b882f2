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
    use poolgate::concurrency::{ConcurrencyController, ScopeKind};
    use poolgate::domain::Account;
    use poolgate::error::GatewayError;
    use poolgate::selector::{Selection, bind_after_wait, derive_session_hash, select};

    fn account(id: &str, group: &str, models: &[&str], max_concurrency: u32) -> Account {
        Account {
            account_id: id.to_string(),
            name: id.to_string(),
            group_id: group.to_string(),
            healthy: true,
            max_concurrency,
            base_url: "https://example.invalid".into(),
            credential: "secret".into(),
            supported_models: models.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn filters_by_model_and_health() {
        let controller = ConcurrencyController::new();
        let mut unhealthy = account("a1", "g1", &["gpt-x"], 5);
        unhealthy.healthy = false;
        let wrong_model = account("a2", "g1", &["other-model"], 5);
        let good = account("a3", "g1", &["gpt-x"], 5);
        let accounts = vec![unhealthy, wrong_model, good];

        let selection = select(&controller, "g1", "", "gpt-x", &accounts, &[]).unwrap();
        match selection {
            Selection::Acquired { account, .. } => assert_eq!(account.account_id, "a3"),
            Selection::WaitPlan { .. } => panic!("expected an immediate acquire"),
        }
    }

    #[test]
    fn i5_failed_accounts_are_excluded() {
        let controller = ConcurrencyController::new();
        let accounts = vec![account("a1", "g1", &["m"], 5), account("a2", "g1", &["m"], 5)];
        let selection = select(
            &controller,
            "g1",
            "",
            "m",
            &accounts,
            &["a1".to_string()],
        )
        .unwrap();
        match selection {
            Selection::Acquired { account, .. } => assert_eq!(account.account_id, "a2"),
            _ => panic!("expected acquire"),
        }
    }

    #[test]
    fn empty_candidate_set_is_no_account() {
        let controller = ConcurrencyController::new();
        let accounts = vec![account("a1", "g1", &["other"], 5)];
        let err = select(&controller, "g1", "", "m", &accounts, &[]).unwrap_err();
        assert!(matches!(err, GatewayError::NoAccount(_)));
    }

    #[test]
    fn load_aware_ranking_prefers_less_loaded_account() {
        let controller = ConcurrencyController::new();
        let busy = account("busy", "g1", &["m"], 10);
        let idle = account("idle", "g1", &["m"], 10);
        // Fill "busy" up with 5 active slots so its load ratio is higher.
        let mut guards = Vec::new();
        for _ in 0..5 {
            guards.push(
                controller
                    .try_acquire(ScopeKind::Account, "busy", 10)
                    .unwrap(),
            );
        }

        let selection = select(
            &controller,
            "g1",
            "",
            "m",
            &[busy, idle],
            &[],
        )
        .unwrap();
        match selection {
            Selection::Acquired { account, .. } => assert_eq!(account.account_id, "idle"),
            _ => panic!("expected acquire"),
        }
        drop(guards);
    }

    #[test]
    fn wait_plan_returned_when_all_full() {
        let controller = ConcurrencyController::new();
        let a = account("full", "g1", &["m"], 1);
        let _guard = controller.try_acquire(ScopeKind::Account, "full", 1).unwrap();
        let selection = select(&controller, "g1", "", "m", &[a], &[]).unwrap();
        match selection {
            Selection::WaitPlan { account } => assert_eq!(account.account_id, "full"),
            Selection::Acquired { .. } => panic!("expected a wait plan"),
        }
    }

    #[test]
    fn sticky_session_is_preferred_when_live() {
        let controller = ConcurrencyController::new();
        let a1 = account("a1", "g1", &["m"], 5);
        let a2 = account("a2", "g1", &["m"], 5);
        bind_after_wait("g1", "sess1", "a2");
        let selection = select(&controller, "g1", "sess1", "m", &[a1, a2], &[]).unwrap();
        match selection {
            Selection::Acquired { account, .. } => assert_eq!(account.account_id, "a2"),
            _ => panic!("expected acquire"),
        }
    }

    #[test]
    fn session_hash_derivation_prefers_header_then_body_then_empty() {
        assert_eq!(derive_session_hash(Some("h"), Some("b")), "h");
        assert_eq!(derive_session_hash(None, Some("b")), "b");
        assert_eq!(derive_session_hash(None, None), "");
        assert_eq!(derive_session_hash(Some(""), Some("b")), "b");
    }
}
