//! Shared runtime state assembled at startup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use arc_swap::ArcSwap;

use mproxy_common::GlobalConfig;
use mproxy_provider_core::{
    ClientPool, CooldownTracker, ModelRegistry, ModelResolver, PayloadRules, RateLimiter,
    Selector, SharedClientPool, UpstreamProvider,
};
use mproxy_store::{CredentialRecord, CredentialStore};

use crate::access::AccessManager;
use crate::usage::UsageStats;

pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub cooldown: Arc<CooldownTracker>,
    pub registry: Arc<ModelRegistry>,
    pub resolver: Arc<ModelResolver>,
    pub limiter: Arc<RateLimiter>,
    pub selector: Arc<Selector>,
    pub pool: SharedClientPool,
    pub providers: HashMap<String, Arc<dyn UpstreamProvider>>,
    pub rules: RwLock<PayloadRules>,
    pub usage: Arc<UsageStats>,
    pub access: Arc<AccessManager>,
    pub store: Option<Arc<dyn CredentialStore>>,
    /// Mirror of the persisted records, used to write token updates back
    /// without clobbering operator-edited fields.
    pub records: Mutex<HashMap<String, CredentialRecord>>,
}

impl AppState {
    pub fn provider(&self, tag: &str) -> Option<Arc<dyn UpstreamProvider>> {
        self.providers.get(tag).cloned()
    }

    pub fn apply_rules(&self, model: &str, payload: &mut serde_json::Value) {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        rules.apply(model, payload);
    }
}

/// Everything `AppState` needs besides what bootstrap wires up itself.
pub struct AppStateBuilder {
    pub global: GlobalConfig,
    pub providers: HashMap<String, Arc<dyn UpstreamProvider>>,
    pub rules: PayloadRules,
    pub access: Arc<AccessManager>,
    pub store: Option<Arc<dyn CredentialStore>>,
    pub resolver_tables: mproxy_provider_core::ResolverTables,
}

impl AppStateBuilder {
    pub fn build(self) -> Arc<AppState> {
        let cooldown = Arc::new(CooldownTracker::new());
        let registry = Arc::new(ModelRegistry::new(cooldown.clone()));
        let resolver = Arc::new(ModelResolver::new(
            registry.clone(),
            self.resolver_tables,
            self.global.routing.auto_preference.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(self.global.rate_limit.clone()));
        let selector = Arc::new(Selector::new(match self.global.routing.strategy {
            mproxy_common::RoutingStrategy::RoundRobin => {
                mproxy_provider_core::SelectPolicy::RoundRobin
            }
            mproxy_common::RoutingStrategy::FillFirst => {
                mproxy_provider_core::SelectPolicy::FillFirst
            }
        }));
        Arc::new(AppState {
            global: ArcSwap::from_pointee(self.global),
            cooldown,
            registry,
            resolver,
            limiter,
            selector,
            pool: Arc::new(ClientPool::new()),
            providers: self.providers,
            rules: RwLock::new(self.rules),
            usage: Arc::new(UsageStats::new()),
            access: self.access,
            store: self.store,
            records: Mutex::new(HashMap::new()),
        })
    }
}
