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
    use poolgate::auth::{AuthError, Authenticator, InMemoryAuthenticator};

    #[tokio::test]
    async fn authenticates_a_registered_bearer_token() {
        let auth = InMemoryAuthenticator::new();
        auth.register("sk-test123", "u1", "key1", "g1");
        let ctx = auth
            .authenticate(Some("Bearer sk-test123"))
            .await
            .unwrap();
        assert_eq!(ctx.user_id, "u1");
        assert_eq!(ctx.group_id, "g1");
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        let auth = InMemoryAuthenticator::new();
        assert!(matches!(
            auth.authenticate(None).await,
            Err(AuthError::Missing)
        ));
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let auth = InMemoryAuthenticator::new();
        assert!(matches!(
            auth.authenticate(Some("Bearer nope")).await,
            Err(AuthError::Invalid)
        ));
    }

    #[tokio::test]
    async fn disabled_key_is_rejected() {
        let auth = InMemoryAuthenticator::new();
        auth.register("sk-test123", "u1", "key1", "g1");
        auth.disable("sk-test123");
        assert!(matches!(
            auth.authenticate(Some("Bearer sk-test123")).await,
            Err(AuthError::Invalid)
        ));
    }
}
