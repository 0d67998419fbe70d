use async_trait::async_trait;
use bytes::Bytes;

use mproxy_provider_core::{
    header_set, ClientHandle, CredentialKind, ModelInfo, ProviderResult, Proto, ThinkingSupport,
    UpstreamHttpRequest, UpstreamProvider,
};

use super::{base_headers, effective_base, model_info};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct ClaudeProvider {
    base_url: String,
}

impl ClaudeProvider {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }
}

#[async_trait]
impl UpstreamProvider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn proto(&self) -> Proto {
        Proto::Claude
    }

    fn models(&self, _client: &ClientHandle) -> Vec<ModelInfo> {
        vec![
            model_info("claude-opus-4-5", "claude", 200_000, 64_000, ThinkingSupport::FixedBudget),
            model_info("claude-sonnet-4-5", "claude", 200_000, 64_000, ThinkingSupport::FixedBudget),
            model_info("claude-haiku-4-5", "claude", 200_000, 64_000, ThinkingSupport::FixedBudget),
        ]
    }

    async fn build_generate(
        &self,
        client: &ClientHandle,
        _model: &str,
        body: Bytes,
        stream: bool,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let base = effective_base(client, &self.base_url);
        let mut headers = base_headers(client);
        match client.kind {
            CredentialKind::ApiKey => {
                if let Some(key) = &client.api_key {
                    header_set(&mut headers, "x-api-key", key);
                }
            }
            CredentialKind::OAuth => {
                if let Some(token) = client.token_snapshot().await {
                    header_set(
                        &mut headers,
                        "authorization",
                        &format!("Bearer {}", token.access_token),
                    );
                }
            }
        }
        header_set(&mut headers, "anthropic-version", ANTHROPIC_VERSION);
        header_set(&mut headers, "content-type", "application/json");

        Ok(UpstreamHttpRequest {
            method: "POST",
            url: format!("{base}/v1/messages"),
            headers,
            body: Some(body),
            is_stream: stream,
        })
    }
}
