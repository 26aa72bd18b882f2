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

//! Core of an API gateway that multiplexes end-user API keys onto a pool
//! of upstream LLM provider accounts: admission, account selection,
//! streaming-aware forwarding with billing token-transfer rewriting, and
//! failover across accounts.

pub mod auth;
pub mod concurrency;
pub mod config;
pub mod domain;
pub mod error;
pub mod failover;
pub mod forwarder;
pub mod preflight;
pub mod recorder;
pub mod selector;
pub mod shaper;
pub mod store;
pub mod transfer;
