use async_trait::async_trait;
use bytes::Bytes;

use mproxy_provider_core::{
    header_set, ClientHandle, CredentialKind, ModelInfo, ProviderFamily, ProviderResult, Proto,
    ThinkingSupport, UpstreamHttpRequest, UpstreamProvider,
};

use super::{base_headers, effective_base, model_info};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Gemini-dialect upstream; also serves the Vertex and Antigravity tags with
/// their own base URLs.
pub struct GeminiProvider {
    family: ProviderFamily,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(family: ProviderFamily, base_url: Option<String>) -> Self {
        Self {
            family,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }
}

#[async_trait]
impl UpstreamProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        self.family.tag()
    }

    fn proto(&self) -> Proto {
        Proto::Gemini
    }

    fn models(&self, _client: &ClientHandle) -> Vec<ModelInfo> {
        let tag = self.family.tag();
        vec![
            model_info("gemini-2.5-pro", tag, 1_048_576, 65_536, ThinkingSupport::FixedBudget),
            model_info("gemini-2.5-flash", tag, 1_048_576, 65_536, ThinkingSupport::FixedBudget),
            model_info("gemini-2.5-flash-lite", tag, 1_048_576, 65_536, ThinkingSupport::FixedBudget),
        ]
    }

    async fn build_generate(
        &self,
        client: &ClientHandle,
        model: &str,
        body: Bytes,
        stream: bool,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let base = effective_base(client, &self.base_url);
        let action = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let url = format!("{base}/v1beta/models/{model}:{action}");

        let mut headers = base_headers(client);
        match client.kind {
            CredentialKind::ApiKey => {
                if let Some(key) = &client.api_key {
                    header_set(&mut headers, "x-goog-api-key", key);
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
        header_set(&mut headers, "content-type", "application/json");

        Ok(UpstreamHttpRequest {
            method: "POST",
            url,
            headers,
            body: Some(body),
            is_stream: stream,
        })
    }
}
