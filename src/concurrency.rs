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

//! Two-level concurrency controller (spec.md §4.A).
//!
//! One `ScopeSlot` per scope (`user_id` or `account_id`), held in a
//! `DashMap` the same way the teacher keys its `LATENCY_FAILS` map by path —
//! generalized here to one fine-grained lock per scope rather than one
//! global lock, per §5's "Shared resources" note.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};

use crate::error::GatewayError;

/// Which counter family a scope id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    User,
    Account,
}

/// Saturating, monotone function from a user's `concurrency` to the size
/// of their wait queue (spec.md §4.A "User-level max-wait calibration").
pub fn calculate_max_wait(concurrency: u32) -> u32 {
    concurrency.max((4 * concurrency).min(32))
}

#[derive(Default)]
struct ScopeSlot {
    active: AtomicU32,
    waiting: AtomicU32,
    notify: Notify,
}

/// A caller-visible token that resolves when the request has been
/// cancelled (client disconnect, deadline elapsed). Mirrors
/// `tokio_util::sync::CancellationToken` closely enough for this crate's
/// needs without adding the dependency.
#[derive(Clone)]
pub struct RequestCancellation {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for RequestCancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCancellation {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called. Safe to await repeatedly
    /// from multiple tasks; registers before checking the flag so a
    /// `cancel()` racing with the first poll is never missed.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Tracks the one-way transition from "nothing has reached the client yet"
/// to "a heartbeat or a forwarded byte has" (spec.md §4.E `stream_started`).
/// Callers that need to react to the transition (rather than just poll it)
/// `wait()` on it; mirrors `RequestCancellation`'s notify-then-check loop.
#[derive(Clone)]
pub struct StreamStarted {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for StreamStarted {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStarted {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Marks the flag. Idempotent; safe to call from more than one site
    /// (the ping ticker and the Forwarder both call this).
    pub fn mark(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_started(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `mark()` has been called. Registers before checking
    /// the flag so a `mark()` racing with the first poll is never missed.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_started() {
                return;
            }
            notified.await;
        }
    }
}

/// Emits a protocol-appropriate heartbeat on the client connection while a
/// slot wait is in progress (spec.md §4.A). The SSE comment form (`: ping`)
/// is the default shape; other ingress dialects may implement their own.
#[async_trait]
pub trait Heartbeat: Send + Sync {
    async fn ping(&self);
}

/// RAII handle for a granted slot. Releases exactly once, whether by an
/// explicit `release()` call or by being dropped (covers client
/// disconnect / context cancellation / panic unwinding alike — the Rust
/// idiom for spec.md §9's "wrap the release fn with a once-guard").
pub struct SlotGuard {
    slot: Arc<ScopeSlot>,
    released: Arc<AtomicBool>,
}

impl SlotGuard {
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.slot.active.fetch_sub(1, Ordering::SeqCst);
        self.slot.notify.notify_waiters();
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Options controlling a single `acquire_slot_with_wait` call. Owned and
/// `Arc`-backed throughout so the call can be driven from a spawned task,
/// not just the request's own future.
pub struct AcquireOptions {
    pub max_active: u32,
    pub wait_timeout: Duration,
    pub is_streaming: bool,
    pub ping_interval: Option<Duration>,
    pub heartbeat: Option<Arc<dyn Heartbeat>>,
    pub stream_started: StreamStarted,
    pub cancellation: RequestCancellation,
}

/// Holds the per-scope active/waiting counters for the lifetime of the
/// process. One instance is shared across all requests; user and account
/// scopes live in separate namespaces so a colliding id never aliases.
#[derive(Default)]
pub struct ConcurrencyController {
    users: DashMap<String, Arc<ScopeSlot>>,
    accounts: DashMap<String, Arc<ScopeSlot>>,
}

impl ConcurrencyController {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: ScopeKind) -> &DashMap<String, Arc<ScopeSlot>> {
        match kind {
            ScopeKind::User => &self.users,
            ScopeKind::Account => &self.accounts,
        }
    }

    fn slot(&self, kind: ScopeKind, scope_id: &str) -> Arc<ScopeSlot> {
        self.table(kind)
            .entry(scope_id.to_string())
            .or_insert_with(|| Arc::new(ScopeSlot::default()))
            .clone()
    }

    /// Current `(active, waiting)` for a scope, for tests and diagnostics.
    pub fn counters(&self, kind: ScopeKind, scope_id: &str) -> (u32, u32) {
        match self.table(kind).get(scope_id) {
            Some(s) => (
                s.active.load(Ordering::SeqCst),
                s.waiting.load(Ordering::SeqCst),
            ),
            None => (0, 0),
        }
    }

    /// Atomically increments `waiting` iff below `max_waiting` (spec.md
    /// §4.A `IncrementWait`). Never blocks.
    pub fn increment_wait(
        &self,
        kind: ScopeKind,
        scope_id: &str,
        max_waiting: u32,
    ) -> Result<(), GatewayError> {
        let slot = self.slot(kind, scope_id);
        loop {
            let current = slot.waiting.load(Ordering::SeqCst);
            if current >= max_waiting {
                return Err(GatewayError::QueueFull);
            }
            if slot
                .waiting
                .compare_exchange(
                    current,
                    current + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Counterpart to `increment_wait`; callers must invoke at most once
    /// per successful increment (spec.md §4.A).
    pub fn decrement_wait(&self, kind: ScopeKind, scope_id: &str) {
        let slot = self.slot(kind, scope_id);
        let _ = slot
            .waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                Some(w.saturating_sub(1))
            });
    }

    /// Attempts to reserve a slot immediately, without entering the wait
    /// path at all. Used by the Account Selector's rank-order probing
    /// (spec.md §4.B step 4), where `IncrementWait` is not required
    /// because no suspension happens.
    pub fn try_acquire(&self, kind: ScopeKind, scope_id: &str, max_active: u32) -> Option<SlotGuard> {
        let slot = self.slot(kind, scope_id);
        Self::try_reserve(&slot, max_active).map(|released| SlotGuard {
            slot,
            released,
        })
    }

    fn try_reserve(slot: &Arc<ScopeSlot>, max_active: u32) -> Option<Arc<AtomicBool>> {
        loop {
            let current = slot.active.load(Ordering::SeqCst);
            if current >= max_active {
                return None;
            }
            if slot
                .active
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(Arc::new(AtomicBool::new(false)));
            }
        }
    }

    /// Blocks until a slot is available, the deadline expires, or the
    /// request is cancelled — emitting heartbeats on the client connection
    /// while waiting, if configured (spec.md §4.A `AcquireSlotWithWait`).
    pub async fn acquire_slot_with_wait(
        &self,
        kind: ScopeKind,
        scope_id: &str,
        opts: AcquireOptions,
    ) -> Result<SlotGuard, GatewayError> {
        let slot = self.slot(kind, scope_id);

        if let Some(released) = Self::try_reserve(&slot, opts.max_active) {
            return Ok(SlotGuard { slot, released });
        }

        let deadline = Instant::now() + opts.wait_timeout;
        let mut ping_ticker = opts.ping_interval.map(tokio::time::interval);
        // The first tick of an `interval` fires immediately; drain it so the
        // heartbeat cadence starts `ping_interval` after the wait begins.
        if let Some(ticker) = ping_ticker.as_mut() {
            ticker.tick().await;
        }

        loop {
            if opts.cancellation.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }

            let notified = slot.notify.notified();
            tokio::select! {
                biased;

                _ = opts.cancellation.cancelled() => {
                    return Err(GatewayError::Cancelled);
                }
                _ = sleep_until(deadline) => {
                    return Err(GatewayError::SlotTimeout);
                }
                _ = async {
                    match ping_ticker.as_mut() {
                        Some(t) => t.tick().await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if opts.is_streaming {
                        if let Some(hb) = opts.heartbeat.as_ref() {
                            hb.ping().await;
                        }
                        opts.stream_started.mark();
                    }
                    continue;
                }
                _ = notified => {}
            }

            if let Some(released) = Self::try_reserve(&slot, opts.max_active) {
                return Ok(SlotGuard { slot, released });
            }
        }
    }
}
