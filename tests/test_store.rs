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
    use poolgate::domain::{Account, User};
    use poolgate::store::{GatewayStore, InMemoryStore, StoreError};

    fn user(id: &str) -> User {
        User {
            user_id: id.to_string(),
            balance_cents: 1000,
            concurrency: 2,
            cache_read_transfer_ratio: None,
            cache_read_transfer_probability: None,
        }
    }

    #[tokio::test]
    async fn round_trips_a_user() {
        let store = InMemoryStore::new();
        store.put_user(user("u1"));
        let fetched = store.get_user("u1").await.unwrap();
        assert_eq!(fetched.balance_cents, 1000);
    }

    #[tokio::test]
    async fn missing_user_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.get_user("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn accounts_are_grouped_by_group_id() {
        let store = InMemoryStore::new();
        store.put_account(Account {
            account_id: "a1".into(),
            name: "a1".into(),
            group_id: "g1".into(),
            healthy: true,
            max_concurrency: 5,
            base_url: "https://x".into(),
            credential: "c".into(),
            supported_models: vec!["m".into()],
        });
        let accounts = store.get_accounts_for_group("g1").await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(store.get_accounts_for_group("g2").await.unwrap().len(), 0);
    }
}
