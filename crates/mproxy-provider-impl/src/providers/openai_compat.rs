use async_trait::async_trait;
use bytes::Bytes;

use mproxy_provider_core::{
    header_set, ClientHandle, CredentialKind, ModelInfo, ProviderFamily, ProviderResult, Proto,
    ThinkingSupport, UpstreamHttpRequest, UpstreamProvider,
};

use super::{base_headers, effective_base, model_info};

/// One implementation for every family speaking the OpenAI chat dialect:
/// codex, qwen, kimi, iflow, copilot and plain openai-compatible endpoints.
pub struct OpenAiCompatProvider {
    family: ProviderFamily,
    base_url: String,
}

impl OpenAiCompatProvider {
    pub fn new(family: ProviderFamily, base_url: Option<String>) -> Self {
        let default = match family {
            ProviderFamily::Codex => "https://chatgpt.com/backend-api/codex",
            ProviderFamily::Qwen => "https://dashscope.aliyuncs.com/compatible-mode",
            ProviderFamily::Kimi => "https://api.moonshot.ai",
            ProviderFamily::IFlow => "https://api.iflow.cn",
            ProviderFamily::Copilot => "https://api.githubcopilot.com",
            _ => "https://api.openai.com",
        };
        Self {
            family,
            base_url: base_url.unwrap_or_else(|| default.to_string()),
        }
    }

    fn model_table(&self) -> Vec<ModelInfo> {
        let tag = self.family.tag();
        match self.family {
            ProviderFamily::Qwen => vec![
                model_info("qwen3-coder-plus", tag, 1_048_576, 65_536, ThinkingSupport::None),
                model_info("qwen3-max", tag, 262_144, 65_536, ThinkingSupport::Levels),
            ],
            ProviderFamily::Kimi => vec![
                model_info("kimi-k2", tag, 262_144, 32_768, ThinkingSupport::None),
                model_info("kimi-k2-thinking", tag, 262_144, 32_768, ThinkingSupport::Auto),
            ],
            ProviderFamily::IFlow => vec![
                model_info("deepseek-v3", tag, 131_072, 32_768, ThinkingSupport::None),
                model_info("glm-4.6", tag, 131_072, 32_768, ThinkingSupport::Levels),
            ],
            ProviderFamily::Copilot => vec![
                model_info("gpt-5", tag, 400_000, 128_000, ThinkingSupport::Levels),
                model_info("claude-sonnet-4-5", tag, 200_000, 64_000, ThinkingSupport::Levels),
            ],
            _ => vec![
                model_info("gpt-5", tag, 400_000, 128_000, ThinkingSupport::Levels),
                model_info("gpt-5-mini", tag, 400_000, 128_000, ThinkingSupport::Levels),
                model_info("gpt-5-codex", tag, 400_000, 128_000, ThinkingSupport::Levels),
            ],
        }
    }
}

#[async_trait]
impl UpstreamProvider for OpenAiCompatProvider {
    fn name(&self) -> &'static str {
        self.family.tag()
    }

    fn proto(&self) -> Proto {
        Proto::OpenAI
    }

    fn models(&self, _client: &ClientHandle) -> Vec<ModelInfo> {
        self.model_table()
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
        let bearer = match client.kind {
            CredentialKind::ApiKey => client.api_key.clone(),
            CredentialKind::OAuth => client
                .token_snapshot()
                .await
                .map(|token| token.access_token),
        };
        if let Some(bearer) = bearer {
            header_set(&mut headers, "authorization", &format!("Bearer {bearer}"));
        }
        header_set(&mut headers, "content-type", "application/json");

        Ok(UpstreamHttpRequest {
            method: "POST",
            url: format!("{base}/v1/chat/completions"),
            headers,
            body: Some(body),
            is_stream: stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_provider_core::header_get;

    #[tokio::test]
    async fn kimi_family_uses_its_default_base_and_bearer() {
        let provider = OpenAiCompatProvider::new(ProviderFamily::Kimi, None);
        let mut client = ClientHandle::new(
            "k1".to_string(),
            "kimi",
            Proto::OpenAI,
            CredentialKind::ApiKey,
            "sk-...",
            0,
            None,
        );
        client.api_key = Some("sk-kimi".to_string());
        let req = provider
            .build_generate(&client, "kimi-k2", Bytes::from_static(b"{}"), false)
            .await
            .unwrap();
        assert_eq!(req.url, "https://api.moonshot.ai/v1/chat/completions");
        assert_eq!(
            header_get(&req.headers, "authorization"),
            Some("Bearer sk-kimi")
        );
    }

    #[test]
    fn model_tables_differ_per_family() {
        let qwen = OpenAiCompatProvider::new(ProviderFamily::Qwen, None);
        let codex = OpenAiCompatProvider::new(ProviderFamily::Codex, None);
        assert!(qwen.model_table().iter().any(|m| m.id.starts_with("qwen")));
        assert!(codex.model_table().iter().any(|m| m.id == "gpt-5-codex"));
    }
}
