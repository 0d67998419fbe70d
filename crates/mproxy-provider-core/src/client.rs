//! Runtime credential handles.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::Proto;

pub type ClientId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    OAuth,
    ApiKey,
}

/// OAuth token material owned by one client.
///
/// Provider-specific fields (client id/secret, start URL, region, profile
/// ARN) ride along so the refresher can drive any of the Kiro flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_verified: Option<OffsetDateTime>,
}

impl OAuthToken {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// True once the refresh window has opened (10 minutes before expiry).
    pub fn needs_refresh(&self, now: OffsetDateTime, lead: time::Duration) -> bool {
        now >= self.expires_at - lead
    }
}

/// Consistent view of the token taken under one read-lock acquisition:
/// access token and expiry always belong to the same revision.
#[derive(Debug, Clone)]
pub struct TokenSnapshot {
    pub access_token: String,
    pub expires_at: OffsetDateTime,
}

/// One usable upstream credential.
#[derive(Debug)]
pub struct ClientHandle {
    pub client_id: ClientId,
    pub provider_tag: String,
    pub proto: Proto,
    pub kind: CredentialKind,
    /// Account email for OAuth clients, masked key for API keys.
    pub label: String,
    pub priority: i32,
    /// Optional model-name prefix advertised in front of this client's models.
    pub prefix: Option<String>,
    pub proxy_url: Option<String>,
    pub base_url: Option<String>,
    pub extra_headers: HashMap<String, String>,
    /// Synthesized from environment; never persisted.
    pub runtime_only: bool,
    /// API key clients keep the key here; OAuth clients use the token slot.
    pub api_key: Option<String>,
    token: RwLock<Option<OAuthToken>>,
}

impl ClientHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: ClientId,
        provider_tag: impl Into<String>,
        proto: Proto,
        kind: CredentialKind,
        label: impl Into<String>,
        priority: i32,
        token: Option<OAuthToken>,
    ) -> Self {
        Self {
            client_id,
            provider_tag: provider_tag.into(),
            proto,
            kind,
            label: label.into(),
            priority,
            prefix: None,
            proxy_url: None,
            base_url: None,
            extra_headers: HashMap::new(),
            runtime_only: false,
            api_key: None,
            token: RwLock::new(token),
        }
    }

    pub async fn token_snapshot(&self) -> Option<TokenSnapshot> {
        let guard = self.token.read().await;
        guard.as_ref().map(|token| TokenSnapshot {
            access_token: token.access_token.clone(),
            expires_at: token.expires_at,
        })
    }

    pub async fn token(&self) -> Option<OAuthToken> {
        self.token.read().await.clone()
    }

    /// Swap in a refreshed token. Readers observe either the old or the new
    /// token, never a mix.
    pub async fn replace_token(&self, token: OAuthToken) {
        let mut guard = self.token.write().await;
        *guard = Some(token);
    }

    pub async fn touch_last_verified(&self, at: OffsetDateTime) {
        let mut guard = self.token.write().await;
        if let Some(token) = guard.as_mut() {
            token.last_verified = Some(at);
        }
    }

    /// Rate-limiter key for this credential.
    pub fn token_key(&self) -> String {
        format!("{}:{}", self.provider_tag, self.client_id)
    }
}

pub type SharedClient = Arc<ClientHandle>;
