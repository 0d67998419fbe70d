use async_trait::async_trait;
use bytes::Bytes;

use mproxy_provider_core::{
    header_set, ClientHandle, ModelInfo, OAuthToken, ProviderError, ProviderResult, Proto,
    QuotaSignal, ThinkingSupport, UnavailableDecision, UpstreamFailure, UpstreamHttpRequest,
    UpstreamProvider,
};

use super::{base_headers, effective_base, model_info};
use crate::kiro;
use crate::kiro::oauth::DEFAULT_AUTH_BASE_URL;

const DEFAULT_BASE_URL: &str = "https://codewhisperer.us-east-1.amazonaws.com";

/// Kiro / CodeWhisperer upstream. Speaks the Claude dialect and owns the
/// full OAuth refresh lifecycle (social, builder-id, IDC).
pub struct KiroProvider {
    base_url: String,
    auth_base_url: String,
}

impl KiroProvider {
    pub fn new(base_url: Option<String>, auth_base_url: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            auth_base_url: auth_base_url.unwrap_or_else(|| DEFAULT_AUTH_BASE_URL.to_string()),
        }
    }

    pub fn auth_base_url(&self) -> &str {
        &self.auth_base_url
    }
}

#[async_trait]
impl UpstreamProvider for KiroProvider {
    fn name(&self) -> &'static str {
        "kiro"
    }

    fn proto(&self) -> Proto {
        Proto::Claude
    }

    fn models(&self, _client: &ClientHandle) -> Vec<ModelInfo> {
        vec![
            model_info("claude-sonnet-4-5", "kiro", 200_000, 64_000, ThinkingSupport::FixedBudget),
            model_info("claude-haiku-4-5", "kiro", 200_000, 64_000, ThinkingSupport::FixedBudget),
            model_info("claude-opus-4-5", "kiro", 200_000, 64_000, ThinkingSupport::FixedBudget),
        ]
    }

    async fn build_generate(
        &self,
        client: &ClientHandle,
        _model: &str,
        body: Bytes,
        stream: bool,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let token = client
            .token()
            .await
            .ok_or(ProviderError::MissingCredentialField("token"))?;

        let base = effective_base(client, &self.base_url);
        let mut headers = base_headers(client);
        header_set(
            &mut headers,
            "authorization",
            &format!("Bearer {}", token.access_token),
        );
        if let Some(arn) = &token.profile_arn {
            header_set(&mut headers, "x-amzn-codewhisperer-profile-arn", arn);
        }
        header_set(
            &mut headers,
            "user-agent",
            &kiro::kiro_user_agent(&client.token_key()),
        );
        header_set(&mut headers, "content-type", "application/json");

        Ok(UpstreamHttpRequest {
            method: "POST",
            url: format!("{base}/generateAssistantResponse"),
            headers,
            body: Some(body),
            is_stream: stream,
        })
    }

    /// CodeWhisperer reports exhausted quota as 403 with a limit-shaped
    /// body, not only as 429.
    fn classify_failure(&self, failure: &UpstreamFailure) -> UnavailableDecision {
        if let UpstreamFailure::Http { status: 403, body, .. } = failure {
            let text = String::from_utf8_lossy(body).to_lowercase();
            if text.contains("limit") || text.contains("quota") {
                return UnavailableDecision {
                    signal: QuotaSignal::Quota,
                    retry_after: None,
                };
            }
        }
        mproxy_provider_core::default_unavailable(failure)
    }

    async fn refresh(&self, client: &ClientHandle) -> ProviderResult<OAuthToken> {
        let token = client
            .token()
            .await
            .ok_or(ProviderError::MissingCredentialField("token"))?;
        kiro::refresh_token(
            client.proxy_url.as_deref(),
            &self.auth_base_url,
            &token,
            &client.token_key(),
        )
        .await
    }
}
