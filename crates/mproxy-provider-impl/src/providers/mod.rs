//! Concrete `UpstreamProvider` implementations.

mod claude;
mod gemini;
mod kiro;
mod openai_compat;

pub use claude::ClaudeProvider;
pub use gemini::GeminiProvider;
pub use kiro::KiroProvider;
pub use openai_compat::OpenAiCompatProvider;

use std::sync::Arc;

use mproxy_provider_core::{
    ClientHandle, Headers, ModelInfo, ProviderConfig, ProviderFamily, ThinkingSupport,
    UpstreamProvider,
};

/// Instantiate the implementation for a configured provider family.
///
/// Families sharing the OpenAI dialect all resolve to `OpenAiCompatProvider`
/// parameterized by tag and default base URL; Vertex and Antigravity ride on
/// the Gemini implementation.
pub fn build_provider(config: &ProviderConfig) -> Arc<dyn UpstreamProvider> {
    let family = config.family();
    let base_url = config.base_url().map(str::to_string);
    match family {
        ProviderFamily::Gemini | ProviderFamily::Vertex | ProviderFamily::Antigravity => {
            Arc::new(GeminiProvider::new(family, base_url))
        }
        ProviderFamily::Claude => Arc::new(ClaudeProvider::new(base_url)),
        ProviderFamily::Kiro => {
            let auth_base_url = match config {
                ProviderConfig::Kiro(kiro) => kiro.auth_base_url.clone(),
                _ => None,
            };
            Arc::new(KiroProvider::new(base_url, auth_base_url))
        }
        ProviderFamily::Codex
        | ProviderFamily::Qwen
        | ProviderFamily::Kimi
        | ProviderFamily::IFlow
        | ProviderFamily::Copilot
        | ProviderFamily::OpenAI => Arc::new(OpenAiCompatProvider::new(family, base_url)),
    }
}

pub(crate) fn effective_base<'a>(client: &'a ClientHandle, default: &'a str) -> &'a str {
    client.base_url.as_deref().unwrap_or(default).trim_end_matches('/')
}

pub(crate) fn base_headers(client: &ClientHandle) -> Headers {
    client
        .extra_headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub(crate) fn model_info(
    id: &str,
    family: &str,
    context_length: u64,
    max_output_tokens: u64,
    thinking: ThinkingSupport,
) -> ModelInfo {
    ModelInfo {
        id: id.to_string(),
        display_name: id.to_string(),
        family: family.to_string(),
        context_length,
        max_output_tokens,
        supported_methods: vec![
            "generateContent".to_string(),
            "streamGenerateContent".to_string(),
        ],
        thinking,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_provider_core::Proto;

    #[test]
    fn families_resolve_to_shared_implementations() {
        let qwen = build_provider(&ProviderConfig::Qwen(Default::default()));
        assert_eq!(qwen.name(), "qwen");
        assert_eq!(qwen.proto(), Proto::OpenAI);

        let antigravity = build_provider(&ProviderConfig::Antigravity(Default::default()));
        assert_eq!(antigravity.name(), "antigravity");
        assert_eq!(antigravity.proto(), Proto::Gemini);

        let kiro = build_provider(&ProviderConfig::Kiro(Default::default()));
        assert_eq!(kiro.name(), "kiro");
        assert_eq!(kiro.proto(), Proto::Claude);
    }
}
