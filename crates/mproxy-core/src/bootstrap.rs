//! Startup wiring: load credentials, build clients, register models, start
//! the background refresh and cooldown pruning loops.

use std::collections::HashMap;
use std::sync::Arc;

use mproxy_common::GlobalConfig;
use mproxy_provider_core::{
    ClientHandle, CredentialKind, ModelInfo, OAuthToken, PayloadRules, ProviderConfig,
    ProviderFamily, ResolverTables, SharedClient, UpstreamProvider,
};
use mproxy_provider_impl::{build_provider, TokenRefresher, TokenRefresherConfig};
use mproxy_store::{CredentialRecord, CredentialStore, FileCredentialStore, StoreError};

use crate::access::{AccessManager, ConfigKeyAccess, OpenAccess};
use crate::engine::Engine;
use crate::state::{AppState, AppStateBuilder};
use crate::upstream::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("upstream client error: {0}")]
    Client(String),
}

pub struct BootConfig {
    pub global: GlobalConfig,
    pub providers: Vec<ProviderConfig>,
    pub resolver_tables: ResolverTables,
    pub rules: PayloadRules,
}

pub struct Runtime {
    pub state: Arc<AppState>,
    pub engine: Arc<Engine>,
    pub refresher: Arc<TokenRefresher>,
}

pub async fn bootstrap(config: BootConfig) -> Result<Runtime, BootstrapError> {
    let provider_configs = if config.providers.is_empty() {
        default_provider_configs()
    } else {
        config.providers
    };
    let mut providers: HashMap<String, Arc<dyn UpstreamProvider>> = HashMap::new();
    for provider_config in &provider_configs {
        let provider = build_provider(provider_config);
        providers.insert(provider.name().to_string(), provider);
    }

    let access = Arc::new(AccessManager::new(vec![
        Box::new(ConfigKeyAccess::new(config.global.api_keys.iter().cloned())),
        Box::new(OpenAccess::new(config.global.api_keys.is_empty())),
    ]));

    let store: Arc<dyn CredentialStore> =
        Arc::new(FileCredentialStore::new(config.global.auth_dir.clone()));
    let records = store.load_all().await?;

    let proxy = config.global.proxy.clone();
    let state = AppStateBuilder {
        global: config.global,
        providers,
        rules: config.rules,
        access,
        store: Some(store),
        resolver_tables: config.resolver_tables,
    }
    .build();

    for record in records {
        {
            let mut mirror = state.records.lock().unwrap_or_else(|e| e.into_inner());
            mirror.insert(record.id.clone(), record.clone());
        }
        if record.disabled {
            tracing::info!(client = %record.id, "credential disabled, not loading");
            continue;
        }
        match client_from_record(&record) {
            Some(client) => attach_client(&state, Arc::new(client)),
            None => {
                tracing::warn!(client = %record.id, provider = %record.provider, "unknown provider tag, skipping");
            }
        }
    }

    for client in runtime_clients_from_env() {
        attach_client(&state, Arc::new(client));
    }

    let upstream: Arc<dyn UpstreamClient> = Arc::new(
        WreqUpstreamClient::new(UpstreamClientConfig {
            proxy,
            ..Default::default()
        })
        .map_err(|err| BootstrapError::Client(err.to_string()))?,
    );
    let engine = Arc::new(Engine::new(state.clone(), upstream));

    state.cooldown.spawn_prune_task();

    let refresher_state = state.clone();
    let refresher = Arc::new(
        TokenRefresher::new(
            TokenRefresherConfig::default(),
            state.pool.clone(),
            state.providers.clone(),
        )
        .on_refreshed(move |client_id, token| {
            let state = refresher_state.clone();
            let client_id = client_id.to_string();
            let token = token.clone();
            tokio::spawn(async move {
                persist_record_token(&state, &client_id, token).await;
            });
        }),
    );
    refresher.clone().spawn();

    Ok(Runtime {
        state,
        engine,
        refresher,
    })
}

fn default_provider_configs() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig::Gemini(Default::default()),
        ProviderConfig::Claude(Default::default()),
        ProviderConfig::Codex(Default::default()),
        ProviderConfig::Kiro(Default::default()),
        ProviderConfig::OpenAI(Default::default()),
    ]
}

/// Build the runtime handle for one persisted credential.
pub fn client_from_record(record: &CredentialRecord) -> Option<ClientHandle> {
    let family = ProviderFamily::from_tag(&record.provider)?;
    let label = if record.label.is_empty() {
        record.id.clone()
    } else {
        record.label.clone()
    };
    let mut client = ClientHandle::new(
        record.id.clone(),
        record.provider.clone(),
        family.proto(),
        record.kind,
        label,
        record.priority,
        record.token.clone(),
    );
    client.prefix = record.prefix.clone();
    client.proxy_url = record.proxy_url.clone();
    client.base_url = record.base_url.clone();
    client.extra_headers = record.extra_headers.clone();
    client.api_key = record.api_key.clone();
    Some(client)
}

/// Runtime-only clients synthesized from environment variables; never
/// persisted.
fn runtime_clients_from_env() -> Vec<ClientHandle> {
    let mut out = Vec::new();
    for (var, tag) in [
        ("GEMINI_API_KEY", "gemini"),
        ("ANTHROPIC_API_KEY", "claude"),
        ("OPENAI_API_KEY", "openai"),
    ] {
        let Ok(key) = std::env::var(var) else {
            continue;
        };
        if key.trim().is_empty() {
            continue;
        }
        let Some(family) = ProviderFamily::from_tag(tag) else {
            continue;
        };
        let mut client = ClientHandle::new(
            format!("env-{tag}"),
            tag,
            family.proto(),
            CredentialKind::ApiKey,
            format!("{var} (env)"),
            0,
            None,
        );
        client.runtime_only = true;
        client.api_key = Some(key.trim().to_string());
        out.push(client);
    }
    out
}

/// Insert the client into the pool and register its advertised models,
/// honoring alias/fork entries, exclusions, and the client prefix.
pub fn attach_client(state: &Arc<AppState>, client: SharedClient) {
    let Some(provider) = state.provider(&client.provider_tag) else {
        tracing::warn!(client = %client.client_id, provider = %client.provider_tag, "no provider implementation");
        return;
    };
    let mut advertised: Vec<ModelInfo> = Vec::new();
    for info in provider.models(&client) {
        for name in state
            .resolver
            .advertised_names(&client.provider_tag, &info.id)
        {
            if state.resolver.is_excluded(&client.provider_tag, &name) {
                continue;
            }
            let mut advertised_info = info.clone();
            advertised_info.id = match &client.prefix {
                Some(prefix) => format!("{prefix}{name}"),
                None => name,
            };
            advertised.push(advertised_info);
        }
    }
    state
        .registry
        .register(&client.client_id, &client.provider_tag, advertised);
    state.pool.insert(client);
}

/// Remove the client from selection and the availability view.
pub fn detach_client(state: &Arc<AppState>, client_id: &str) {
    state.pool.remove(client_id);
    state.registry.unregister(client_id);
}

/// Persist enable/disable and apply it to the live runtime.
pub async fn set_client_enabled(
    state: &Arc<AppState>,
    client_id: &str,
    enabled: bool,
) -> Result<(), StoreError> {
    if let Some(store) = &state.store {
        store.set_enabled(client_id, enabled).await?;
    }
    let record = {
        let mut records = state.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(client_id) {
            record.disabled = !enabled;
            Some(record.clone())
        } else {
            None
        }
    };
    if enabled {
        if let Some(record) = record
            && let Some(client) = client_from_record(&record)
        {
            attach_client(state, Arc::new(client));
        }
    } else {
        detach_client(state, client_id);
    }
    Ok(())
}

/// Write a background-refreshed token back through the record mirror.
pub async fn persist_record_token(state: &Arc<AppState>, client_id: &str, token: OAuthToken) {
    let Some(store) = &state.store else {
        return;
    };
    let record = {
        let records = state.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(client_id).cloned()
    };
    let Some(mut record) = record else {
        return;
    };
    record.token = Some(token);
    match store.save(&record).await {
        Ok(()) => {
            let mut records = state.records.lock().unwrap_or_else(|e| e.into_inner());
            records.insert(record.id.clone(), record);
        }
        Err(err) => {
            tracing::warn!(client = %client_id, %err, "failed to persist refreshed token");
        }
    }
}
