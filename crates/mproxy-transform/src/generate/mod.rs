//! Generate-content translators, one module per directed (caller, provider)
//! pair.

pub mod claude2gemini;
pub mod claude2openai;
pub mod gemini2claude;
pub mod gemini2openai;
pub mod openai2claude;
pub mod openai2gemini;

#[cfg(test)]
mod tests;

use serde_json::Value;

/// Claude requires max_tokens; used when the caller did not provide one.
pub(crate) const DEFAULT_MAX_TOKENS: u32 = 4096;

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parse streamed/serialized tool-call arguments; malformed input becomes an
/// empty object rather than poisoning the whole message.
pub(crate) fn parse_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::Object(Default::default()))
}

pub(crate) fn arguments_string(args: &Option<Value>) -> String {
    match args {
        Some(value) => serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()),
        None => "{}".to_string(),
    }
}

/// Reasoning-effort level to thinking-budget tokens.
pub fn effort_to_budget(effort: &str) -> Option<u32> {
    match effort.to_ascii_lowercase().as_str() {
        "minimal" | "low" => Some(1024),
        "medium" => Some(8192),
        "high" => Some(16384),
        "ultra" | "xhigh" => Some(32768),
        _ => None,
    }
}

/// Thinking-budget tokens to the nearest reasoning-effort level.
pub fn budget_to_effort(budget: i64) -> &'static str {
    if budget <= 0 {
        return "low";
    }
    if budget <= 2048 {
        "low"
    } else if budget <= 8192 {
        "medium"
    } else if budget <= 16384 {
        "high"
    } else {
        "ultra"
    }
}
