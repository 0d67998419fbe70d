//! Model registry: which clients serve which models, and the availability
//! view derived from cooldown state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;

use mproxy_protocol::{claude, gemini, openai};

use crate::client::ClientId;
use crate::cooldown::{CooldownTracker, QUOTA_REASON};
use crate::Proto;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingSupport {
    #[default]
    None,
    FixedBudget,
    Auto,
    Levels,
}

impl ThinkingSupport {
    pub fn supported(&self) -> bool {
        !matches!(self, ThinkingSupport::None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    /// Provider family advertising this model (gemini, claude, codex, ...).
    pub family: String,
    pub context_length: u64,
    pub max_output_tokens: u64,
    #[serde(default)]
    pub supported_methods: Vec<String>,
    #[serde(default)]
    pub thinking: ThinkingSupport,
}

#[derive(Debug)]
struct Registration {
    info: ModelInfo,
    /// (client, refcount) in registration order; order is the deterministic
    /// tie-break for selection and `auto` resolution.
    clients: Vec<(ClientId, usize)>,
    last_updated: OffsetDateTime,
}

/// Row served by the management model-availability listing.
#[derive(Debug, Clone, Serialize)]
pub struct UnavailableModel {
    pub model_id: String,
    pub model_name: String,
    pub provider: String,
    pub client_id: ClientId,
    pub reason: String,
    pub reason_text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
}

type ChangeHook = Box<dyn Fn() + Send + Sync>;

pub struct ModelRegistry {
    models: RwLock<HashMap<String, Registration>>,
    client_providers: RwLock<HashMap<ClientId, String>>,
    cooldown: Arc<CooldownTracker>,
    hooks: Mutex<Vec<ChangeHook>>,
}

impl ModelRegistry {
    pub fn new(cooldown: Arc<CooldownTracker>) -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            client_providers: RwLock::new(HashMap::new()),
            cooldown,
            hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn cooldown(&self) -> &Arc<CooldownTracker> {
        &self.cooldown
    }

    /// Register a hook fired after every registration change. Hooks run
    /// outside the registry locks.
    pub fn on_change(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(hook));
    }

    fn notify(&self) {
        let hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        for hook in hooks.iter() {
            hook();
        }
    }

    pub fn register(&self, client_id: &str, provider_tag: &str, models: Vec<ModelInfo>) {
        {
            let mut providers = self
                .client_providers
                .write()
                .unwrap_or_else(|e| e.into_inner());
            providers.insert(client_id.to_string(), provider_tag.to_string());
        }
        {
            let mut map = self.models.write().unwrap_or_else(|e| e.into_inner());
            let now = OffsetDateTime::now_utc();
            for info in models {
                let registration = map.entry(info.id.clone()).or_insert_with(|| Registration {
                    info: info.clone(),
                    clients: Vec::new(),
                    last_updated: now,
                });
                registration.last_updated = now;
                match registration
                    .clients
                    .iter_mut()
                    .find(|(id, _)| id == client_id)
                {
                    Some((_, count)) => *count += 1,
                    None => registration.clients.push((client_id.to_string(), 1)),
                }
            }
        }
        self.notify();
    }

    /// Remove every registration contributed by the client. After return, the
    /// client is observable in no candidate list.
    pub fn unregister(&self, client_id: &str) {
        {
            let mut map = self.models.write().unwrap_or_else(|e| e.into_inner());
            let now = OffsetDateTime::now_utc();
            for registration in map.values_mut() {
                registration.clients.retain(|(id, _)| id != client_id);
                registration.last_updated = now;
            }
            map.retain(|_, registration| !registration.clients.is_empty());
        }
        {
            let mut providers = self
                .client_providers
                .write()
                .unwrap_or_else(|e| e.into_inner());
            providers.remove(client_id);
        }
        self.cooldown.remove_client(client_id);
        self.notify();
    }

    /// Drop one reference of (client, model); the registration disappears
    /// when its last client reference goes.
    pub fn unregister_model(&self, client_id: &str, model_id: &str) {
        {
            let mut map = self.models.write().unwrap_or_else(|e| e.into_inner());
            if let Some(registration) = map.get_mut(model_id) {
                if let Some(pos) = registration
                    .clients
                    .iter()
                    .position(|(id, _)| id == client_id)
                {
                    let (_, count) = &mut registration.clients[pos];
                    *count -= 1;
                    if *count == 0 {
                        registration.clients.remove(pos);
                    }
                }
                if registration.clients.is_empty() {
                    map.remove(model_id);
                }
            }
        }
        self.notify();
    }

    pub fn get(&self, model_id: &str) -> Option<ModelInfo> {
        let map = self.models.read().unwrap_or_else(|e| e.into_inner());
        map.get(model_id).map(|r| r.info.clone())
    }

    pub fn client_provider(&self, client_id: &str) -> Option<String> {
        let providers = self
            .client_providers
            .read()
            .unwrap_or_else(|e| e.into_inner());
        providers.get(client_id).cloned()
    }

    /// Distinct provider tags serving the model, in registration order.
    pub fn providers(&self, model_id: &str) -> Vec<String> {
        let map = self.models.read().unwrap_or_else(|e| e.into_inner());
        let providers = self
            .client_providers
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let Some(registration) = map.get(model_id) else {
            return Vec::new();
        };
        let mut out: Vec<String> = Vec::new();
        for (client, _) in &registration.clients {
            if let Some(tag) = providers.get(client)
                && !out.contains(tag)
            {
                out.push(tag.clone());
            }
        }
        out
    }

    /// Clients serving the model, in registration order.
    pub fn candidates(&self, model_id: &str) -> Vec<ClientId> {
        let map = self.models.read().unwrap_or_else(|e| e.into_inner());
        map.get(model_id)
            .map(|r| r.clients.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn model_ids(&self) -> Vec<String> {
        let map = self.models.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = map.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn is_listed(&self, model_id: &str, registration: &Registration) -> bool {
        let n_total = registration.clients.len();
        if n_total == 0 {
            return false;
        }
        let mut n_expired = 0usize;
        let mut n_cooldown = 0usize;
        let mut n_other_suspended = 0usize;
        for (client, _) in &registration.clients {
            if self.cooldown.quota_hit(client, model_id).is_some() {
                n_expired += 1;
            }
            match self.cooldown.suspension_reason(client, model_id) {
                Some(reason) if reason == QUOTA_REASON => n_cooldown += 1,
                Some(_) => n_other_suspended += 1,
                None => {}
            }
        }
        let effective = n_total.saturating_sub(n_expired + n_other_suspended);
        effective > 0
            || ((n_expired > 0 || n_cooldown > 0) && n_other_suspended == 0)
    }

    /// Availability view shaped for the caller's dialect.
    pub fn available(&self, caller: Proto) -> Value {
        let map = self.models.read().unwrap_or_else(|e| e.into_inner());
        let mut listed: Vec<&Registration> = map
            .iter()
            .filter(|(id, registration)| self.is_listed(id, registration))
            .map(|(_, registration)| registration)
            .collect();
        listed.sort_by(|a, b| a.info.id.cmp(&b.info.id));

        match caller {
            Proto::OpenAI => {
                let data: Vec<openai::Model> = listed
                    .iter()
                    .map(|r| openai::Model {
                        id: r.info.id.clone(),
                        object: "model".to_string(),
                        owned_by: r.info.family.clone(),
                        created: r.last_updated.unix_timestamp(),
                        kind: Some(r.info.family.clone()),
                        context_length: Some(r.info.context_length),
                    })
                    .collect();
                json!({ "object": "list", "data": data })
            }
            Proto::Claude => {
                let data: Vec<claude::Model> = listed
                    .iter()
                    .map(|r| {
                        let thinking = r.info.thinking.supported();
                        claude::Model {
                            kind: "model".to_string(),
                            id: r.info.id.clone(),
                            display_name: r.info.display_name.clone(),
                            created_at: r
                                .last_updated
                                .format(&time::format_description::well_known::Rfc3339)
                                .unwrap_or_default(),
                            thinking: Some(thinking),
                            extended_thinking: Some(thinking),
                        }
                    })
                    .collect();
                serde_json::to_value(claude::ModelList {
                    data,
                    has_more: false,
                    first_id: None,
                    last_id: None,
                })
                .unwrap_or_else(|_| json!({"data": []}))
            }
            Proto::Gemini => {
                let models: Vec<gemini::Model> = listed
                    .iter()
                    .map(|r| gemini::Model {
                        name: format!("models/{}", r.info.id),
                        display_name: r.info.display_name.clone(),
                        description: None,
                        input_token_limit: r.info.context_length,
                        output_token_limit: r.info.max_output_tokens,
                        supported_generation_methods: if r.info.supported_methods.is_empty() {
                            vec![
                                "generateContent".to_string(),
                                "streamGenerateContent".to_string(),
                            ]
                        } else {
                            r.info.supported_methods.clone()
                        },
                    })
                    .collect();
                serde_json::to_value(gemini::ModelList { models })
                    .unwrap_or_else(|_| json!({"models": []}))
            }
        }
    }

    /// All (client, model) pairs currently quota-cooling or suspended.
    pub fn unavailable_models(&self) -> Vec<UnavailableModel> {
        let map = self.models.read().unwrap_or_else(|e| e.into_inner());
        let mut rows = Vec::new();
        for (model_id, registration) in map.iter() {
            for (client, _) in &registration.clients {
                if let Some(hit) = self.cooldown.quota_hit(client, model_id) {
                    rows.push(UnavailableModel {
                        model_id: model_id.clone(),
                        model_name: registration.info.display_name.clone(),
                        provider: self.client_provider(client).unwrap_or_default(),
                        client_id: client.clone(),
                        reason: "cooldown".to_string(),
                        reason_text: "quota cooldown active".to_string(),
                        since: hit,
                    });
                }
                if let Some(reason) = self.cooldown.suspension_reason(client, model_id) {
                    let (kind, text) = if reason == QUOTA_REASON {
                        ("quota_exceeded".to_string(), "suspended for quota".to_string())
                    } else {
                        ("suspended".to_string(), reason.clone())
                    };
                    rows.push(UnavailableModel {
                        model_id: model_id.clone(),
                        model_name: registration.info.display_name.clone(),
                        provider: self.client_provider(client).unwrap_or_default(),
                        client_id: client.clone(),
                        reason: kind,
                        reason_text: text,
                        since: registration.last_updated,
                    });
                }
            }
        }
        rows.sort_by(|a, b| (&a.model_id, &a.client_id).cmp(&(&b.model_id, &b.client_id)));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, family: &str) -> ModelInfo {
        ModelInfo {
            id: id.to_string(),
            display_name: id.to_string(),
            family: family.to_string(),
            context_length: 200_000,
            max_output_tokens: 8_192,
            supported_methods: Vec::new(),
            thinking: ThinkingSupport::FixedBudget,
        }
    }

    fn registry() -> ModelRegistry {
        ModelRegistry::new(Arc::new(CooldownTracker::new()))
    }

    #[test]
    fn register_is_reference_counted() {
        let reg = registry();
        reg.register("c1", "claude", vec![info("m", "claude")]);
        reg.register("c2", "kiro", vec![info("m", "claude")]);
        assert_eq!(reg.candidates("m"), vec!["c1".to_string(), "c2".to_string()]);
        assert_eq!(reg.providers("m"), vec!["claude".to_string(), "kiro".to_string()]);

        reg.unregister("c1");
        assert_eq!(reg.candidates("m"), vec!["c2".to_string()]);
        reg.unregister("c2");
        assert!(reg.get("m").is_none());
    }

    #[test]
    fn unregister_model_decrements_reference_counts() {
        let reg = registry();
        // The same (client, model) contributed twice.
        reg.register("c1", "claude", vec![info("m", "claude")]);
        reg.register("c1", "claude", vec![info("m", "claude")]);

        reg.unregister_model("c1", "m");
        assert_eq!(reg.candidates("m"), vec!["c1".to_string()]);

        reg.unregister_model("c1", "m");
        assert!(reg.get("m").is_none());
    }

    #[test]
    fn unregister_removes_client_from_all_candidate_lists() {
        let reg = registry();
        reg.register("c1", "claude", vec![info("a", "claude"), info("b", "claude")]);
        reg.unregister("c1");
        assert!(reg.candidates("a").is_empty());
        assert!(reg.candidates("b").is_empty());
    }

    #[test]
    fn change_hook_fires_on_mutation() {
        let reg = registry();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        reg.on_change(move || {
            count2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        reg.register("c1", "claude", vec![info("m", "claude")]);
        reg.unregister("c1");
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn availability_hides_fully_other_suspended_models() {
        let reg = registry();
        reg.register("c1", "claude", vec![info("m", "claude")]);
        reg.cooldown().suspend("c1", "m", "credential");
        let listing = reg.available(Proto::OpenAI);
        assert!(listing["data"].as_array().unwrap().is_empty());
    }

    #[test]
    fn availability_keeps_quota_cooling_models_listed() {
        let reg = registry();
        reg.register("c1", "claude", vec![info("m", "claude")]);
        reg.cooldown().mark_quota("c1", "m");
        let listing = reg.available(Proto::OpenAI);
        assert_eq!(listing["data"].as_array().unwrap().len(), 1);

        // Same for quota-reason suspension.
        let reg = registry();
        reg.register("c1", "claude", vec![info("m", "claude")]);
        reg.cooldown().suspend("c1", "m", QUOTA_REASON);
        let listing = reg.available(Proto::Claude);
        assert_eq!(listing["data"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn caller_shapes_carry_dialect_fields() {
        let reg = registry();
        reg.register("c1", "gemini", vec![info("gemini-2.5-pro", "gemini")]);

        let openai_listing = reg.available(Proto::OpenAI);
        assert_eq!(openai_listing["data"][0]["context_length"], 200_000);

        let claude_listing = reg.available(Proto::Claude);
        assert_eq!(claude_listing["data"][0]["thinking"], true);
        assert_eq!(claude_listing["data"][0]["extended_thinking"], true);

        let gemini_listing = reg.available(Proto::Gemini);
        assert_eq!(gemini_listing["models"][0]["name"], "models/gemini-2.5-pro");
        assert_eq!(gemini_listing["models"][0]["inputTokenLimit"], 200_000);
        assert_eq!(gemini_listing["models"][0]["outputTokenLimit"], 8_192);
    }

    #[test]
    fn unavailable_listing_reports_quota_and_suspension_rows() {
        let reg = registry();
        reg.register("c1", "kiro", vec![info("m", "claude")]);
        reg.register("c2", "kiro", vec![info("m", "claude")]);
        reg.cooldown().mark_quota("c1", "m");
        reg.cooldown().suspend("c2", "m", "banned");
        let rows = reg.unavailable_models();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].reason, "cooldown");
        assert_eq!(rows[1].reason, "suspended");
        assert_eq!(rows[1].reason_text, "banned");
    }
}
