//! default / default-raw / override / filter rules applied to the upstream
//! payload as a JSON tree, addressed by dotted paths.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadRuleKind {
    /// Set only when the key is absent.
    Default,
    /// Same as Default, but the value string is parsed as raw JSON.
    DefaultRaw,
    /// Always set.
    Override,
    /// Delete the key.
    Filter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadRule {
    pub kind: PayloadRuleKind,
    /// Model selector; `*` globs allowed (exact, `prefix*`, `*suffix`,
    /// `*infix*`, bare `*`).
    pub models: String,
    /// Dotted parameter path, e.g. `generationConfig.thinkingConfig.thinkingBudget`.
    pub path: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadRules {
    pub rules: Vec<PayloadRule>,
}

impl PayloadRules {
    pub fn new(rules: Vec<PayloadRule>) -> Self {
        Self { rules }
    }

    /// Apply all matching rules in kind order: default, default-raw,
    /// override, filter.
    pub fn apply(&self, model: &str, payload: &mut Value) {
        for kind in [
            PayloadRuleKind::Default,
            PayloadRuleKind::DefaultRaw,
            PayloadRuleKind::Override,
            PayloadRuleKind::Filter,
        ] {
            for rule in self.rules.iter().filter(|r| r.kind == kind) {
                if !model_selector_matches(&rule.models, model) {
                    continue;
                }
                apply_rule(rule, payload);
            }
        }
    }
}

fn apply_rule(rule: &PayloadRule, payload: &mut Value) {
    let segments: Vec<&str> = rule.path.split('.').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return;
    }
    match rule.kind {
        PayloadRuleKind::Default => {
            if lookup(payload, &segments).is_none() {
                set_path(payload, &segments, rule.value.clone());
            }
        }
        PayloadRuleKind::DefaultRaw => {
            if lookup(payload, &segments).is_none() {
                let parsed = rule
                    .value
                    .as_str()
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or_else(|| rule.value.clone());
                set_path(payload, &segments, parsed);
            }
        }
        PayloadRuleKind::Override => set_path(payload, &segments, rule.value.clone()),
        PayloadRuleKind::Filter => remove_path(payload, &segments),
    }
}

fn lookup<'a>(value: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments {
        current = current.as_object()?.get(*segment)?;
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects (and replacing non-object
/// intermediates) as needed.
fn set_path(value: &mut Value, segments: &[&str], new_value: Value) {
    let mut current = value;
    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        let Some(obj) = current.as_object_mut() else {
            return;
        };
        current = obj
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if !current.is_object() {
        *current = Value::Object(Default::default());
    }
    if let Some(obj) = current.as_object_mut() {
        obj.insert(segments[segments.len() - 1].to_string(), new_value);
    }
}

fn remove_path(value: &mut Value, segments: &[&str]) {
    let mut current = value;
    for segment in &segments[..segments.len() - 1] {
        let Some(next) = current.as_object_mut().and_then(|obj| obj.get_mut(*segment)) else {
            return;
        };
        current = next;
    }
    if let Some(obj) = current.as_object_mut() {
        obj.remove(segments[segments.len() - 1]);
    }
}

fn model_selector_matches(selector: &str, model: &str) -> bool {
    if selector == "*" {
        return true;
    }
    let starts_wild = selector.starts_with('*');
    let ends_wild = selector.ends_with('*');
    let inner = selector.trim_matches('*');
    match (starts_wild, ends_wild) {
        (false, false) => model == selector,
        (false, true) => model.starts_with(inner),
        (true, false) => model.ends_with(inner),
        (true, true) => model.contains(inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(kind: PayloadRuleKind, models: &str, path: &str, value: Value) -> PayloadRule {
        PayloadRule {
            kind,
            models: models.to_string(),
            path: path.to_string(),
            value,
        }
    }

    #[test]
    fn default_sets_only_missing_leaves() {
        let rules = PayloadRules::new(vec![rule(
            PayloadRuleKind::Default,
            "gemini-*",
            "generationConfig.thinkingConfig.thinkingBudget",
            json!(8192),
        )]);

        let mut missing = json!({"contents": []});
        rules.apply("gemini-2.5-pro", &mut missing);
        assert_eq!(
            missing["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            8192
        );

        let mut present = json!({
            "generationConfig": {"thinkingConfig": {"thinkingBudget": 1024}}
        });
        rules.apply("gemini-2.5-pro", &mut present);
        assert_eq!(
            present["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            1024
        );
    }

    #[test]
    fn default_raw_parses_value_as_json() {
        let rules = PayloadRules::new(vec![rule(
            PayloadRuleKind::DefaultRaw,
            "*",
            "safetySettings",
            json!("[{\"category\":\"HARM\",\"threshold\":\"BLOCK_NONE\"}]"),
        )]);
        let mut payload = json!({});
        rules.apply("anything", &mut payload);
        assert_eq!(payload["safetySettings"][0]["category"], "HARM");
    }

    #[test]
    fn override_always_wins_and_filter_deletes() {
        let rules = PayloadRules::new(vec![
            rule(PayloadRuleKind::Override, "*", "temperature", json!(0.0)),
            rule(PayloadRuleKind::Filter, "*", "metadata.user_id", json!(null)),
        ]);
        let mut payload = json!({
            "temperature": 0.9,
            "metadata": {"user_id": "u1", "session": "s1"}
        });
        rules.apply("m", &mut payload);
        assert_eq!(payload["temperature"], 0.0);
        assert!(payload["metadata"].get("user_id").is_none());
        assert_eq!(payload["metadata"]["session"], "s1");
    }

    #[test]
    fn model_selector_globs() {
        assert!(model_selector_matches("*", "anything"));
        assert!(model_selector_matches("gemini-*", "gemini-2.5-pro"));
        assert!(model_selector_matches("*-thinking", "opus-thinking"));
        assert!(!model_selector_matches("gemini-*", "claude-3"));
    }

    #[test]
    fn rules_apply_in_kind_order() {
        // A default and an override on the same path: override wins
        // regardless of list position.
        let rules = PayloadRules::new(vec![
            rule(PayloadRuleKind::Override, "*", "top_k", json!(1)),
            rule(PayloadRuleKind::Default, "*", "top_k", json!(40)),
        ]);
        let mut payload = json!({});
        rules.apply("m", &mut payload);
        assert_eq!(payload["top_k"], 1);
    }
}
