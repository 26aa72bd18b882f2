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

//! Gateway-wide configuration, loaded once from a YAML file into a global
//! `OnceCell`, the same pattern the teacher uses for its own `Config`
//! (spec.md §6 "Config surface").

use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::error::Error;
use std::fs;

/// Concurrency-controller tunables (spec.md §4.A, §6).
#[derive(Debug, Deserialize, Clone)]
pub struct ConcurrencySettings {
    /// SSE heartbeat cadence while a client waits for a slot. `0` disables
    /// the heartbeat (spec.md §6 default).
    #[serde(default)]
    pub ping_interval_seconds: u64,

    /// How long a caller may wait in the queue before `slot_timeout`.
    #[serde(default = "default_slot_wait_timeout_seconds")]
    pub slot_wait_timeout_seconds: u64,
}

fn default_slot_wait_timeout_seconds() -> u64 {
    30
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            ping_interval_seconds: 0,
            slot_wait_timeout_seconds: default_slot_wait_timeout_seconds(),
        }
    }
}

/// Ingress-side limits (spec.md §6 `gateway.body_max_bytes`).
#[derive(Debug, Deserialize, Clone)]
pub struct GatewaySettings {
    #[serde(default = "default_body_max_bytes")]
    pub body_max_bytes: usize,

    /// Default `instructions` string injected into Responses-endpoint
    /// bodies for non-CLI user agents (spec.md §4.D).
    #[serde(default = "default_instructions")]
    pub default_instructions: String,
}

fn default_body_max_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_instructions() -> String {
    "You are a helpful assistant.".to_string()
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            body_max_bytes: default_body_max_bytes(),
            default_instructions: default_instructions(),
        }
    }
}

/// Upstream egress timeouts (spec.md §6).
#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamSettings {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    120
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

/// Main configuration structure loaded from a YAML file. Defines every
/// tunable behavior enumerated in spec.md §6's "Config surface".
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Application identifier, used for namespacing logs/metrics.
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Number of failed-account switches the Failover Loop (§4.F) permits
    /// before returning `upstream_error` to the client.
    #[serde(default = "default_max_account_switches")]
    pub max_account_switches: u32,

    #[serde(default)]
    pub concurrency: ConcurrencySettings,

    #[serde(default)]
    pub gateway: GatewaySettings,

    #[serde(default)]
    pub upstream: UpstreamSettings,

    /// Headers captured into `ErrorLog.headers_snapshot` (spec.md §6).
    /// `Authorization` is always truncated, never carried whole.
    #[serde(default = "default_header_whitelist")]
    pub header_whitelist: Vec<String>,

    /// Port for proxied LLM traffic.
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Port for the admin/metrics router.
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Timeout for the detached Usage Recorder (spec.md §4.G: "its own
    /// 10s timeout, decoupled from the client request's lifetime").
    #[serde(default = "default_recorder_timeout_secs")]
    pub recorder_timeout_secs: u64,
}

fn default_app_id() -> String {
    "poolgate".to_string()
}

fn default_max_account_switches() -> u32 {
    3
}

fn default_header_whitelist() -> Vec<String> {
    crate::domain::DEFAULT_HEADER_WHITELIST
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_proxy_port() -> u16 {
    3000
}

fn default_admin_port() -> u16 {
    3001
}

fn default_recorder_timeout_secs() -> u64 {
    10
}

/// Global, lazily-initialized config object shared across the application.
pub static CONFIG: OnceCell<Config> = OnceCell::new();

impl Config {
    /// Parses configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, Box<dyn Error>> {
        let contents = fs::read_to_string(path)?;
        let parsed: Config = serde_yaml::from_str(&contents)?;

        if parsed.app_id.trim().is_empty() {
            return Err("app_id cannot be empty.".into());
        }
        if parsed.gateway.body_max_bytes == 0 {
            return Err("gateway.body_max_bytes must be positive.".into());
        }
        if parsed.concurrency.slot_wait_timeout_seconds == 0 {
            return Err("concurrency.slot_wait_timeout_seconds must be positive.".into());
        }

        tracing::info!(
            "loaded config: app_id='{}', max_account_switches={}, body_max_bytes={}",
            parsed.app_id,
            parsed.max_account_switches,
            parsed.gateway.body_max_bytes
        );

        Ok(parsed)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            app_id: default_app_id(),
            max_account_switches: default_max_account_switches(),
            concurrency: ConcurrencySettings::default(),
            gateway: GatewaySettings::default(),
            upstream: UpstreamSettings::default(),
            header_whitelist: default_header_whitelist(),
            proxy_port: default_proxy_port(),
            admin_port: default_admin_port(),
            recorder_timeout_secs: default_recorder_timeout_secs(),
        }
    }
}
