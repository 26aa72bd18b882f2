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

//! Token-Transfer Math (spec.md §4.C).
//!
//! Pure functions only: no I/O, no config lookups. Both call sites — the
//! Forwarder rewriting the response body, and the Recorder computing the
//! billed tuple — must call the exact same functions with the exact same
//! inputs to uphold I3/I4 and P1-P3.

use rand::Rng;

/// Moves a fraction `ratio` of `cr` into `cc`, rounding half-up, and
/// clamping `ratio` into `[0, 1]`. Preserves `cc' + cr' == cc + cr` (I4, P1).
pub fn transfer(cc: u64, cr: u64, ratio: f64) -> (u64, u64) {
    let r = ratio.clamp(0.0, 1.0);
    if cr == 0 || r <= 0.0 {
        return (cc, cr);
    }
    if r >= 1.0 {
        return (cc + cr, 0);
    }
    let moved = (cr as f64 * r).round() as u64;
    let moved = moved.min(cr);
    (cc + moved, cr - moved)
}

/// Samples whether the cache-transfer rewrite should apply this request.
/// `prob <= 0` never fires, `prob >= 1` always fires, otherwise a uniform
/// draw from `rng` decides (spec.md §4.C, §9 "probability source").
pub fn should_transfer<R: Rng + ?Sized>(prob: f64, rng: &mut R) -> bool {
    if prob <= 0.0 {
        return false;
    }
    if prob >= 1.0 {
        return true;
    }
    rng.gen::<f64>() < prob
}

/// Resolves the effective `(ratio, probability)` pair, with per-field user
/// overrides taking precedence over the group default (spec.md §4.C, P5).
pub fn effective(
    group_ratio: f64,
    group_prob: f64,
    user_ratio: Option<f64>,
    user_prob: Option<f64>,
) -> (f64, f64) {
    (
        user_ratio.unwrap_or(group_ratio),
        user_prob.unwrap_or(group_prob),
    )
}
