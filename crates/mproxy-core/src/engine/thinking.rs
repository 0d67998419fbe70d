//! Thinking-suffix application onto the upstream payload tree.
//!
//! Suffix values behave like defaults: an explicit thinking setting already
//! present in the caller payload wins.

use serde_json::{json, Value};

use mproxy_provider_core::ThinkingSuffix;
use mproxy_transform::{budget_to_effort, effort_to_budget, Proto};

pub fn apply_thinking(proto: Proto, payload: &mut Value, suffix: &ThinkingSuffix) {
    if matches!(suffix, ThinkingSuffix::None) {
        return;
    }
    match proto {
        Proto::Gemini => apply_gemini(payload, suffix),
        Proto::Claude => apply_claude(payload, suffix),
        Proto::OpenAI => apply_openai(payload, suffix),
    }
}

fn apply_gemini(payload: &mut Value, suffix: &ThinkingSuffix) {
    let config = payload
        .as_object_mut()
        .map(|obj| {
            obj.entry("generationConfig")
                .or_insert_with(|| json!({}))
        })
        .and_then(|v| v.as_object_mut())
        .map(|obj| obj.entry("thinkingConfig").or_insert_with(|| json!({})));
    let Some(Value::Object(thinking)) = config else {
        return;
    };
    if !thinking.contains_key("thinkingBudget") {
        let budget = match suffix {
            ThinkingSuffix::Budget(budget) => *budget,
            // -1 asks Gemini to pick the budget itself.
            ThinkingSuffix::Auto => -1,
            ThinkingSuffix::Level(level) => {
                effort_to_budget(level).map(i64::from).unwrap_or(8192)
            }
            ThinkingSuffix::None => return,
        };
        thinking.insert("thinkingBudget".to_string(), json!(budget));
    }
    thinking
        .entry("includeThoughts")
        .or_insert_with(|| json!(true));
}

fn apply_claude(payload: &mut Value, suffix: &ThinkingSuffix) {
    let Some(obj) = payload.as_object_mut() else {
        return;
    };
    if obj.contains_key("thinking") {
        return;
    }
    let budget = match suffix {
        ThinkingSuffix::Budget(budget) => (*budget).max(1024) as u64,
        ThinkingSuffix::Auto => 8192,
        ThinkingSuffix::Level(level) => effort_to_budget(level).unwrap_or(8192) as u64,
        ThinkingSuffix::None => return,
    };
    obj.insert(
        "thinking".to_string(),
        json!({"type": "enabled", "budget_tokens": budget}),
    );
}

fn apply_openai(payload: &mut Value, suffix: &ThinkingSuffix) {
    let Some(obj) = payload.as_object_mut() else {
        return;
    };
    if obj.contains_key("reasoning_effort") {
        return;
    }
    let effort = match suffix {
        ThinkingSuffix::Budget(budget) => budget_to_effort(*budget),
        ThinkingSuffix::Auto => "medium",
        ThinkingSuffix::Level(level) => level.as_str(),
        ThinkingSuffix::None => return,
    };
    obj.insert("reasoning_effort".to_string(), json!(effort));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_suffix_fills_gemini_thinking_config_when_missing() {
        let mut payload = json!({"contents": []});
        apply_thinking(Proto::Gemini, &mut payload, &ThinkingSuffix::Budget(8192));
        assert_eq!(
            payload["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            8192
        );
        assert_eq!(
            payload["generationConfig"]["thinkingConfig"]["includeThoughts"],
            true
        );
    }

    #[test]
    fn explicit_payload_value_wins_over_suffix() {
        let mut payload = json!({
            "generationConfig": {"thinkingConfig": {"thinkingBudget": 512}}
        });
        apply_thinking(Proto::Gemini, &mut payload, &ThinkingSuffix::Budget(8192));
        assert_eq!(
            payload["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            512
        );
    }

    #[test]
    fn claude_gets_enabled_thinking_with_budget() {
        let mut payload = json!({"model": "claude-sonnet-4-5", "max_tokens": 1024});
        apply_thinking(
            Proto::Claude,
            &mut payload,
            &ThinkingSuffix::Level("high".to_string()),
        );
        assert_eq!(payload["thinking"]["type"], "enabled");
        assert_eq!(payload["thinking"]["budget_tokens"], 16384);
    }

    #[test]
    fn openai_maps_budget_to_effort_level() {
        let mut payload = json!({"model": "gpt-5"});
        apply_thinking(Proto::OpenAI, &mut payload, &ThinkingSuffix::Budget(30000));
        assert_eq!(payload["reasoning_effort"], "ultra");
    }

    #[test]
    fn auto_suffix_delegates_budget_choice() {
        let mut payload = json!({});
        apply_thinking(Proto::Gemini, &mut payload, &ThinkingSuffix::Auto);
        assert_eq!(
            payload["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            -1
        );
    }
}
