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

//! Request Preflight (spec.md §4.D): body-size guard, JSON parse, required
//! field extraction, the Responses-endpoint `instructions` default-inject
//! transform, and `function_call_output` semantic validation.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `/openai/v1/responses`
    Responses,
    /// `/v1/messages`
    Messages,
}

/// Matches user agents sent by first-party CLI clients, which are exempt
/// from the default-`instructions` injection (spec.md §4.D). The exact
/// CLI banner string is an external collaborator's concern; this pattern
/// covers the common `*-cli/x.y.z` and `*Cli` banner shapes (Open Question
/// resolution, see DESIGN.md).
static CLI_USER_AGENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(^|[^a-z])cli(/|$|[^a-z])").unwrap());

fn looks_like_cli(user_agent: Option<&str>) -> bool {
    user_agent.map(|ua| CLI_USER_AGENT.is_match(ua)).unwrap_or(false)
}

pub struct PreflightResult {
    pub model: String,
    pub stream: bool,
    /// Body bytes to forward upstream — re-serialized only when the
    /// `instructions` default was injected; otherwise byte-identical to
    /// the inbound body.
    pub body: Vec<u8>,
    pub prompt_cache_key: Option<String>,
}

/// Runs the full preflight pipeline for one dialect.
pub fn preflight(
    dialect: Dialect,
    raw_body: &[u8],
    user_agent: Option<&str>,
    body_max_bytes: usize,
    default_instructions: &str,
) -> Result<PreflightResult, GatewayError> {
    if raw_body.len() > body_max_bytes {
        return Err(GatewayError::PayloadTooLarge);
    }
    if raw_body.is_empty() {
        return Err(GatewayError::InvalidRequest("request body is empty".into()));
    }

    let mut parsed: Value = serde_json::from_slice(raw_body)
        .map_err(|e| GatewayError::InvalidRequest(format!("malformed JSON body: {e}")))?;

    let model = parsed
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidRequest("\"model\" is required".into()))?
        .to_string();

    let stream = parsed
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let prompt_cache_key = parsed
        .get("prompt_cache_key")
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    let mut body = raw_body.to_vec();

    if dialect == Dialect::Responses {
        validate_function_call_output(&parsed)?;

        let has_instructions = parsed
            .get("instructions")
            .and_then(Value::as_str)
            .map(|s| !s.is_empty())
            .unwrap_or(false);

        if !looks_like_cli(user_agent) && !has_instructions {
            parsed["instructions"] = Value::String(default_instructions.to_string());
            body = serde_json::to_vec(&parsed)
                .map_err(|e| GatewayError::InvalidRequest(format!("failed to re-serialize body: {e}")))?;
        }
    }

    Ok(PreflightResult {
        model,
        stream,
        body,
        prompt_cache_key,
    })
}

/// Validates `function_call_output` preconditions (spec.md §4.D): for
/// every such entry in `input`, either a non-empty `previous_response_id`
/// is present on the request, or `input` carries a matching
/// `tool_call`/`function_call` item with the same `call_id`, or an
/// `item_reference` whose id matches every `call_id` present.
fn validate_function_call_output(body: &Value) -> Result<(), GatewayError> {
    let input = match body.get("input").and_then(Value::as_array) {
        Some(items) => items,
        None => return Ok(()),
    };

    let fco_call_ids: Vec<String> = input
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("function_call_output"))
        .filter_map(|item| item.get("call_id").and_then(Value::as_str))
        .map(|s| s.to_string())
        .collect();

    if fco_call_ids.is_empty() {
        return Ok(());
    }

    let previous_response_id_present = body
        .get("previous_response_id")
        .and_then(Value::as_str)
        .map(|s| !s.is_empty())
        .unwrap_or(false);
    if previous_response_id_present {
        return Ok(());
    }

    let call_ids: HashSet<&str> = input
        .iter()
        .filter(|item| {
            matches!(
                item.get("type").and_then(Value::as_str),
                Some("tool_call") | Some("function_call")
            )
        })
        .filter_map(|item| item.get("call_id").and_then(Value::as_str))
        .collect();

    let item_reference_ids: HashSet<&str> = input
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("item_reference"))
        .filter_map(|item| item.get("id").and_then(Value::as_str))
        .collect();

    for call_id in &fco_call_ids {
        let matched_by_call = call_ids.contains(call_id.as_str());
        let matched_by_reference = item_reference_ids
            .iter()
            .any(|r| fco_call_ids.iter().all(|c| c == r));
        if !matched_by_call && !matched_by_reference {
            return Err(GatewayError::InvalidRequest(format!(
                "function_call_output references call_id '{call_id}' with no previous_response_id, matching tool_call, or item_reference"
            )));
        }
    }

    Ok(())
}
