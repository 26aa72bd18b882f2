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

//! Auth Gate — resolves an `Authorization` header into an `AuthContext`
//! (spec.md §2 component I). Stands in for the out-of-scope authentication
//! middleware; one in-memory implementation ships for tests and dev.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub api_key_id: String,
    pub group_id: String,
}

#[derive(Debug, Error, Clone)]
pub enum AuthError {
    #[error("missing Authorization header")]
    Missing,
    #[error("unknown or disabled API key")]
    Invalid,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, authorization_header: Option<&str>) -> Result<AuthContext, AuthError>;
}

/// Keys are looked up by the bearer token carried in `Authorization`,
/// stripping an optional leading `Bearer ` the way most LLM client SDKs
/// send it.
#[derive(Default)]
pub struct InMemoryAuthenticator {
    keys: DashMap<String, AuthContext>,
    enabled: DashMap<String, bool>,
}

impl InMemoryAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, token: &str, user_id: &str, api_key_id: &str, group_id: &str) {
        self.keys.insert(
            token.to_string(),
            AuthContext {
                user_id: user_id.to_string(),
                api_key_id: api_key_id.to_string(),
                group_id: group_id.to_string(),
            },
        );
        self.enabled.insert(token.to_string(), true);
    }

    pub fn disable(&self, token: &str) {
        self.enabled.insert(token.to_string(), false);
    }
}

fn strip_bearer(header: &str) -> &str {
    header.strip_prefix("Bearer ").unwrap_or(header)
}

#[async_trait]
impl Authenticator for InMemoryAuthenticator {
    async fn authenticate(&self, authorization_header: Option<&str>) -> Result<AuthContext, AuthError> {
        let header = authorization_header.ok_or(AuthError::Missing)?;
        let token = strip_bearer(header);
        let enabled = self.enabled.get(token).map(|e| *e).unwrap_or(false);
        if !enabled {
            return Err(AuthError::Invalid);
        }
        self.keys
            .get(token)
            .map(|ctx| ctx.clone())
            .ok_or(AuthError::Invalid)
    }
}
