//! In-memory usage accounting per (provider, client, model).

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageCounters {
    pub requests: u64,
    pub failures: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct UsageKey {
    pub provider: String,
    pub client_id: String,
    pub model: String,
}

#[derive(Debug, Default)]
pub struct UsageStats {
    rows: Mutex<HashMap<UsageKey, UsageCounters>>,
}

impl UsageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(
        &self,
        provider: &str,
        client_id: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let counters = rows
            .entry(UsageKey {
                provider: provider.to_string(),
                client_id: client_id.to_string(),
                model: model.to_string(),
            })
            .or_default();
        counters.requests += 1;
        counters.input_tokens += input_tokens;
        counters.output_tokens += output_tokens;
    }

    pub fn record_failure(&self, provider: &str, client_id: &str, model: &str) {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let counters = rows
            .entry(UsageKey {
                provider: provider.to_string(),
                client_id: client_id.to_string(),
                model: model.to_string(),
            })
            .or_default();
        counters.requests += 1;
        counters.failures += 1;
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<serde_json::Value> = rows
            .iter()
            .map(|(key, counters)| {
                serde_json::json!({
                    "provider": key.provider,
                    "client_id": key.client_id,
                    "model": key.model,
                    "requests": counters.requests,
                    "failures": counters.failures,
                    "input_tokens": counters.input_tokens,
                    "output_tokens": counters.output_tokens,
                })
            })
            .collect();
        entries.sort_by_key(|e| {
            (
                e["provider"].as_str().unwrap_or_default().to_string(),
                e["client_id"].as_str().unwrap_or_default().to_string(),
                e["model"].as_str().unwrap_or_default().to_string(),
            )
        });
        serde_json::json!({
            "generated_at": OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default(),
            "rows": entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_key() {
        let stats = UsageStats::new();
        stats.record_success("kiro", "c1", "m", 100, 20);
        stats.record_success("kiro", "c1", "m", 50, 10);
        stats.record_failure("kiro", "c2", "m");

        let snapshot = stats.snapshot();
        let rows = snapshot["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["client_id"], "c1");
        assert_eq!(rows[0]["requests"], 2);
        assert_eq!(rows[0]["input_tokens"], 150);
        assert_eq!(rows[1]["failures"], 1);
    }
}
