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

//! Account Selector (spec.md §4.B): filters candidate accounts by model
//! support and health, applies sticky-session and load-aware ordering, and
//! cooperates with the Concurrency Controller on the immediate-acquire
//! fast path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::sync::RwLock;

use crate::concurrency::{ConcurrencyController, ScopeKind, SlotGuard};
use crate::domain::Account;
use crate::error::GatewayError;

/// TTL for a sticky `(group_id, session_hash) -> account_id` binding.
/// Follows the same shape as the teacher's `LATENCY_FAILS` map: a
/// `Lazy<RwLock<HashMap<..>>>`, generalized to carry an expiry instant.
const STICKY_BINDING_TTL: Duration = Duration::from_secs(600);

static STICKY_BINDINGS: Lazy<RwLock<HashMap<(String, String), (String, Instant)>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn sticky_lookup(group_id: &str, session_hash: &str) -> Option<String> {
    if session_hash.is_empty() {
        return None;
    }
    let key = (group_id.to_string(), session_hash.to_string());
    let map = STICKY_BINDINGS.read().unwrap();
    match map.get(&key) {
        Some((account_id, expires_at)) if *expires_at > Instant::now() => {
            Some(account_id.clone())
        }
        _ => None,
    }
}

fn sticky_bind(group_id: &str, session_hash: &str, account_id: &str) {
    if session_hash.is_empty() {
        return;
    }
    let key = (group_id.to_string(), session_hash.to_string());
    let mut map = STICKY_BINDINGS.write().unwrap();
    map.insert(
        key,
        (account_id.to_string(), Instant::now() + STICKY_BINDING_TTL),
    );
}

/// Outcome of a selection attempt.
pub enum Selection {
    /// A slot was acquired immediately against `account`.
    Acquired {
        account: Account,
        guard: SlotGuard,
    },
    /// No account could be acquired immediately; `account` is the
    /// top-ranked candidate the caller should enter the wait flow for.
    WaitPlan { account: Account },
}

/// Ranks candidates by current load, breaking ties by a stable hash of
/// `(account_id, session_hash)` so that repeated selection under equal
/// load fans out deterministically rather than always picking the first
/// account in storage order.
fn rank(accounts: &mut [Account], controller: &ConcurrencyController, session_hash: &str) {
    accounts.sort_by(|a, b| {
        let (active_a, _) = controller.counters(ScopeKind::Account, &a.account_id);
        let (active_b, _) = controller.counters(ScopeKind::Account, &b.account_id);
        let load_a = active_a as f64 / a.max_concurrency.max(1) as f64;
        let load_b = active_b as f64 / b.max_concurrency.max(1) as f64;
        load_a
            .partial_cmp(&load_b)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                hash_of(&a.account_id, session_hash).cmp(&hash_of(&b.account_id, session_hash))
            })
    });
}

/// Stable (not process-seeded) tie-break hash over `(account_id,
/// session_hash)`, so repeated selection under equal load fans out the same
/// way across process restarts rather than just within one run (spec.md
/// §4.B step 3 "round-robin hash").
fn hash_of(account_id: &str, session_hash: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(account_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(session_hash.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[0..8].try_into().unwrap())
}

/// Selects an account for `model` within `group_id`, excluding
/// `failed_account_ids` (the per-request failed set, spec.md I5).
pub fn select(
    controller: &ConcurrencyController,
    group_id: &str,
    session_hash: &str,
    model: &str,
    all_group_accounts: &[Account],
    failed_account_ids: &[String],
) -> Result<Selection, GatewayError> {
    let mut candidates: Vec<Account> = all_group_accounts
        .iter()
        .filter(|a| a.healthy && a.supports_model(model))
        .filter(|a| !failed_account_ids.iter().any(|f| f == &a.account_id))
        .cloned()
        .collect();

    if candidates.is_empty() {
        return Err(GatewayError::NoAccount(model.to_string()));
    }

    // Sticky binding takes priority over load ranking (step 2).
    if let Some(sticky_id) = sticky_lookup(group_id, session_hash) {
        if let Some(pos) = candidates.iter().position(|a| a.account_id == sticky_id) {
            let sticky = candidates.remove(pos);
            candidates.insert(0, sticky);
        }
    }

    // Keep the sticky pick in front; rank the rest by load (step 3).
    let (head, rest) = if sticky_lookup(group_id, session_hash).is_some() {
        candidates.split_at_mut(1)
    } else {
        candidates.split_at_mut(0)
    };
    rank(rest, controller, session_hash);
    let _ = head;

    for account in &candidates {
        if let Some(guard) = controller.try_acquire(
            ScopeKind::Account,
            &account.account_id,
            account.max_concurrency,
        ) {
            sticky_bind(group_id, session_hash, &account.account_id);
            return Ok(Selection::Acquired {
                account: account.clone(),
                guard,
            });
        }
    }

    Ok(Selection::WaitPlan {
        account: candidates[0].clone(),
    })
}

/// Called by the caller after a successful *waited* acquire, to bind the
/// sticky session now that the account is known good (spec.md §4.B step 5,
/// "best-effort; errors logged, not fatal"). Our in-memory map cannot fail
/// to write, so this never logs in practice, but keeps the same seam a
/// remote session store would need.
pub fn bind_after_wait(group_id: &str, session_hash: &str, account_id: &str) {
    sticky_bind(group_id, session_hash, account_id);
}

/// Derives the session hash used for sticky routing: a dedicated header
/// when present, else `prompt_cache_key` from the parsed body, else empty
/// (no binding), per spec.md §3 `StickyBinding`.
pub fn derive_session_hash(header_value: Option<&str>, prompt_cache_key: Option<&str>) -> String {
    if let Some(h) = header_value {
        if !h.is_empty() {
            return h.to_string();
        }
    }
    if let Some(k) = prompt_cache_key {
        if !k.is_empty() {
            return k.to_string();
        }
    }
    String::new()
}

#[allow(dead_code)]
fn _assert_send_sync() {
    fn is_send_sync<T: Send + Sync>() {}
    is_send_sync::<Arc<ConcurrencyController>>();
}
