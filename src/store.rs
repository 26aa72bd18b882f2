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

//! Gateway Store — the persistence seam spec.md §1 calls "external,
//! interfaced but not specified here". Shaped like the teacher's
//! `storage::{azure,gcs,local,s3}` modules, which each expose the same
//! `store_in_cache` / `load_from_cache` / `delete_all_from_cache` trio
//! behind a chosen backend: here, one `async_trait` gives every backend
//! the same shape, and `InMemoryStore` (a `dashmap`-backed implementation,
//! the generalization of the teacher's `local` backend) ships for tests
//! and local development.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::{Account, ApiKey, ErrorLog, Group, Subscription, UsageLog, User};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait GatewayStore: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<User, StoreError>;
    async fn get_api_key(&self, key_id: &str) -> Result<ApiKey, StoreError>;
    async fn get_group(&self, group_id: &str) -> Result<Group, StoreError>;
    async fn get_accounts_for_group(&self, group_id: &str) -> Result<Vec<Account>, StoreError>;
    async fn get_subscription(&self, user_id: &str) -> Result<Option<Subscription>, StoreError>;
    async fn record_usage(&self, log: UsageLog) -> Result<(), StoreError>;
    async fn record_error(&self, log: ErrorLog) -> Result<(), StoreError>;
}

/// `dashmap`-backed `GatewayStore`, analogous to the teacher's `local`
/// storage backend: no external service needed, sufficient for unit and
/// integration tests and for running the gateway standalone in dev.
#[derive(Default)]
pub struct InMemoryStore {
    users: DashMap<String, User>,
    api_keys: DashMap<String, ApiKey>,
    groups: DashMap<String, Group>,
    accounts: DashMap<String, Vec<Account>>,
    subscriptions: DashMap<String, Subscription>,
    pub usage_logs: DashMap<String, UsageLog>,
    pub error_logs: DashMap<String, ErrorLog>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_user(&self, user: User) {
        self.users.insert(user.user_id.clone(), user);
    }

    pub fn put_api_key(&self, key: ApiKey) {
        self.api_keys.insert(key.key_id.clone(), key);
    }

    pub fn put_group(&self, group: Group) {
        self.groups.insert(group.group_id.clone(), group);
    }

    pub fn put_account(&self, account: Account) {
        self.accounts
            .entry(account.group_id.clone())
            .or_default()
            .push(account);
    }

    pub fn put_subscription(&self, subscription: Subscription) {
        self.subscriptions
            .insert(subscription.user_id.clone(), subscription);
    }

    /// Mutates an account in place (used by tests to flip health/capacity).
    pub fn with_account_mut(&self, group_id: &str, account_id: &str, f: impl FnOnce(&mut Account)) {
        if let Some(mut accounts) = self.accounts.get_mut(group_id) {
            if let Some(acc) = accounts.iter_mut().find(|a| a.account_id == account_id) {
                f(acc);
            }
        }
    }
}

#[async_trait]
impl GatewayStore for InMemoryStore {
    async fn get_user(&self, user_id: &str) -> Result<User, StoreError> {
        self.users
            .get(user_id)
            .map(|u| u.clone())
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))
    }

    async fn get_api_key(&self, key_id: &str) -> Result<ApiKey, StoreError> {
        self.api_keys
            .get(key_id)
            .map(|k| k.clone())
            .ok_or_else(|| StoreError::NotFound(format!("api key {key_id}")))
    }

    async fn get_group(&self, group_id: &str) -> Result<Group, StoreError> {
        self.groups
            .get(group_id)
            .map(|g| g.clone())
            .ok_or_else(|| StoreError::NotFound(format!("group {group_id}")))
    }

    async fn get_accounts_for_group(&self, group_id: &str) -> Result<Vec<Account>, StoreError> {
        Ok(self
            .accounts
            .get(group_id)
            .map(|a| a.clone())
            .unwrap_or_default())
    }

    async fn get_subscription(&self, user_id: &str) -> Result<Option<Subscription>, StoreError> {
        Ok(self.subscriptions.get(user_id).map(|s| s.clone()))
    }

    async fn record_usage(&self, log: UsageLog) -> Result<(), StoreError> {
        self.usage_logs.insert(log.request_id.clone(), log);
        Ok(())
    }

    async fn record_error(&self, log: ErrorLog) -> Result<(), StoreError> {
        self.error_logs.insert(log.request_id.clone(), log);
        Ok(())
    }
}
