//! The provider capability interface and upstream HTTP value types.
//!
//! Provider implementations build `UpstreamHttpRequest`s and classify
//! failures; the engine performs IO and owns retry policy.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::client::{ClientHandle, OAuthToken};
use crate::errors::{ProviderError, ProviderResult};
use crate::registry::ModelInfo;
use crate::Proto;

pub type Headers = Vec<(String, String)>;

pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamTransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// Transport-level failure: no HTTP response at all.
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    /// Non-2xx HTTP response captured as bytes.
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
}

impl UpstreamFailure {
    pub fn message(&self) -> String {
        match self {
            UpstreamFailure::Transport { message, .. } => message.clone(),
            UpstreamFailure::Http { body, .. } => String::from_utf8_lossy(body).into_owned(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamFailure::Transport { .. } => None,
            UpstreamFailure::Http { status, .. } => Some(*status),
        }
    }
}

/// Engine-level classification of an upstream failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaSignal {
    /// 429 or a provider-specific quota code: mark quota, try a sibling.
    Quota,
    /// 401/403 with token-shaped body: force one refresh, then demote.
    CredentialExpired,
    /// Account-level suspension keywords in the body.
    Suspended,
    /// 5xx / transport: retryable.
    Transient,
    /// Everything else: surface to the caller.
    Fatal,
}

#[derive(Debug, Clone)]
pub struct UnavailableDecision {
    pub signal: QuotaSignal,
    pub retry_after: Option<Duration>,
}

/// Default failure classification; providers override for their own quota
/// codes and error envelopes.
pub fn default_unavailable(failure: &UpstreamFailure) -> UnavailableDecision {
    match failure {
        UpstreamFailure::Http {
            status, headers, ..
        } => {
            let retry_after = parse_retry_after(headers);
            let signal = match status {
                429 => QuotaSignal::Quota,
                401 | 403 => QuotaSignal::CredentialExpired,
                500..=599 => QuotaSignal::Transient,
                _ => QuotaSignal::Fatal,
            };
            UnavailableDecision {
                signal,
                retry_after,
            }
        }
        UpstreamFailure::Transport { .. } => UnavailableDecision {
            signal: QuotaSignal::Transient,
            retry_after: None,
        },
    }
}

fn parse_retry_after(headers: &Headers) -> Option<Duration> {
    let value = header_get(headers, "retry-after")?;
    let secs = value.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn header_set(headers: &mut Headers, name: &str, value: &str) {
    if let Some(entry) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        entry.1 = value.to_string();
    } else {
        headers.push((name.to_string(), value.to_string()));
    }
}

/// One upstream provider family.
///
/// The capability set is fixed: advertise models, build the generate request
/// in the provider's dialect, classify quota/suspension signals, refresh the
/// backing credential.
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Provider tag (gemini, claude, codex, kiro, ...).
    fn name(&self) -> &'static str;

    /// Dialect the upstream speaks; requests are translated to it before
    /// `build_generate`.
    fn proto(&self) -> Proto;

    /// Models advertised for one credential.
    fn models(&self, client: &ClientHandle) -> Vec<ModelInfo>;

    /// Build the upstream HTTP request carrying an already-translated,
    /// already-rule-processed body.
    async fn build_generate(
        &self,
        client: &ClientHandle,
        model: &str,
        body: Bytes,
        stream: bool,
    ) -> ProviderResult<UpstreamHttpRequest>;

    /// Failure classification; default covers plain HTTP conventions.
    fn classify_failure(&self, failure: &UpstreamFailure) -> UnavailableDecision {
        default_unavailable(failure)
    }

    /// Refresh the client's OAuth token. API-key providers never need this.
    async fn refresh(&self, _client: &ClientHandle) -> ProviderResult<OAuthToken> {
        Err(ProviderError::Unsupported("token refresh"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_classification_maps_statuses() {
        let http = |status: u16| UpstreamFailure::Http {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        };
        assert_eq!(default_unavailable(&http(429)).signal, QuotaSignal::Quota);
        assert_eq!(
            default_unavailable(&http(401)).signal,
            QuotaSignal::CredentialExpired
        );
        assert_eq!(
            default_unavailable(&http(503)).signal,
            QuotaSignal::Transient
        );
        assert_eq!(default_unavailable(&http(400)).signal, QuotaSignal::Fatal);
    }

    #[test]
    fn retry_after_header_is_honored() {
        let failure = UpstreamFailure::Http {
            status: 429,
            headers: vec![("Retry-After".to_string(), "17".to_string())],
            body: Bytes::new(),
        };
        let decision = default_unavailable(&failure);
        assert_eq!(decision.retry_after, Some(Duration::from_secs(17)));
    }

    #[test]
    fn transport_failures_are_transient() {
        let failure = UpstreamFailure::Transport {
            kind: UpstreamTransportErrorKind::Connect,
            message: "connection refused".to_string(),
        };
        assert_eq!(default_unavailable(&failure).signal, QuotaSignal::Transient);
    }
}
