//! Inbound caller authentication: a chain of providers evaluated in order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::HeaderMap;

#[derive(Debug, Clone)]
pub struct Principal {
    pub api_key_id: String,
    pub access_level: String,
    pub metadata: HashMap<String, String>,
}

impl Principal {
    pub fn full(api_key_id: impl Into<String>) -> Self {
        Self {
            api_key_id: api_key_id.into(),
            access_level: "full".to_string(),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug)]
pub enum AccessOutcome {
    Authenticated(Principal),
    /// This provider does not handle the presented material at all.
    NotHandled,
    /// No credential material present.
    NoCredentials,
    /// Credential material present but wrong.
    InvalidCredential,
    /// Terminal failure; the chain stops.
    Terminal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDenied {
    NoCredentials,
    InvalidCredential,
    Terminal(String),
}

impl AccessDenied {
    pub fn message(&self) -> String {
        match self {
            AccessDenied::NoCredentials => "missing api key".to_string(),
            AccessDenied::InvalidCredential => "invalid api key".to_string(),
            AccessDenied::Terminal(message) => message.clone(),
        }
    }
}

pub trait AccessProvider: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap, query: Option<&str>) -> AccessOutcome;
}

pub struct AccessManager {
    providers: Vec<Box<dyn AccessProvider>>,
}

impl AccessManager {
    pub fn new(providers: Vec<Box<dyn AccessProvider>>) -> Self {
        Self { providers }
    }

    /// Walk the chain: NotHandled / NoCredentials / InvalidCredential move
    /// on; Authenticated and Terminal stop. A fully-unauthenticated pass
    /// reports the most severe rejection seen.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> Result<Principal, AccessDenied> {
        let mut saw_invalid = false;
        for provider in &self.providers {
            match provider.authenticate(headers, query) {
                AccessOutcome::Authenticated(principal) => return Ok(principal),
                AccessOutcome::Terminal(message) => {
                    return Err(AccessDenied::Terminal(message));
                }
                AccessOutcome::InvalidCredential => saw_invalid = true,
                AccessOutcome::NoCredentials | AccessOutcome::NotHandled => {}
            }
        }
        if saw_invalid {
            Err(AccessDenied::InvalidCredential)
        } else {
            Err(AccessDenied::NoCredentials)
        }
    }
}

/// Extract key material the way each dialect presents it.
pub fn extract_api_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = header_value(headers, "x-api-key") {
        return Some(value);
    }
    if let Some(value) = header_value(headers, "x-goog-api-key") {
        return Some(value);
    }
    if let Some(auth) = header_value(headers, "authorization") {
        let auth = auth.trim();
        if auth.len() > 7 && auth[..7].eq_ignore_ascii_case("bearer ") {
            let token = auth[7..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    let query = query?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("key=")
            && !value.is_empty()
        {
            return Some(value.to_string());
        }
    }
    None
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Checks the presented key against the configured inbound key set.
pub struct ConfigKeyAccess {
    keys: ArcSwap<HashSet<String>>,
}

impl ConfigKeyAccess {
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            keys: ArcSwap::from_pointee(keys.into_iter().collect()),
        }
    }

    pub fn replace_keys(&self, keys: impl IntoIterator<Item = String>) {
        self.keys.store(Arc::new(keys.into_iter().collect()));
    }
}

impl AccessProvider for ConfigKeyAccess {
    fn authenticate(&self, headers: &HeaderMap, query: Option<&str>) -> AccessOutcome {
        let keys = self.keys.load();
        if keys.is_empty() {
            return AccessOutcome::NotHandled;
        }
        let Some(presented) = extract_api_key(headers, query) else {
            return AccessOutcome::NoCredentials;
        };
        if keys.contains(&presented) {
            let id = format!("key-{}", mask(&presented));
            AccessOutcome::Authenticated(Principal::full(id))
        } else {
            AccessOutcome::InvalidCredential
        }
    }
}

/// Accepts anything when no inbound keys are configured (local use).
pub struct OpenAccess {
    enabled: bool,
}

impl OpenAccess {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl AccessProvider for OpenAccess {
    fn authenticate(&self, _headers: &HeaderMap, _query: Option<&str>) -> AccessOutcome {
        if self.enabled {
            AccessOutcome::Authenticated(Principal::full("anonymous"))
        } else {
            AccessOutcome::NotHandled
        }
    }
}

fn mask(key: &str) -> String {
    if key.len() <= 8 {
        return "*".repeat(key.len());
    }
    format!("{}...{}", &key[..4], &key[key.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    fn manager(keys: &[&str]) -> AccessManager {
        AccessManager::new(vec![
            Box::new(ConfigKeyAccess::new(keys.iter().map(|k| k.to_string()))),
            Box::new(OpenAccess::new(keys.is_empty())),
        ])
    }

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn bearer_and_dialect_headers_authenticate() {
        let manager = manager(&["sk-test"]);
        for (name, value) in [
            ("authorization", "Bearer sk-test"),
            ("x-api-key", "sk-test"),
            ("x-goog-api-key", "sk-test"),
        ] {
            let principal = manager
                .authenticate(&headers_with(name, value), None)
                .unwrap();
            assert_eq!(principal.access_level, "full");
        }
    }

    #[test]
    fn query_key_is_accepted_for_gemini_callers() {
        let manager = manager(&["sk-test"]);
        assert!(manager
            .authenticate(&HeaderMap::new(), Some("alt=sse&key=sk-test"))
            .is_ok());
    }

    #[test]
    fn wrong_key_beats_missing_key_in_severity() {
        let manager = manager(&["sk-test"]);
        let denied = manager
            .authenticate(&headers_with("x-api-key", "wrong"), None)
            .unwrap_err();
        assert_eq!(denied, AccessDenied::InvalidCredential);

        let denied = manager.authenticate(&HeaderMap::new(), None).unwrap_err();
        assert_eq!(denied, AccessDenied::NoCredentials);
    }

    #[test]
    fn open_access_applies_only_without_configured_keys() {
        let open = manager(&[]);
        assert!(open.authenticate(&HeaderMap::new(), None).is_ok());
    }
}
