use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use mproxy_provider_core::{CredentialKind, OAuthToken};

/// On-disk shape of one credential.
///
/// Unknown fields written by external tools ride in `extra` and are written
/// back unchanged on save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// File stem; stable client id.
    #[serde(skip)]
    pub id: String,
    pub provider: String,
    pub kind: CredentialKind,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra_headers: HashMap<String, String>,
    /// Survives restarts; a disabled credential is loaded but never selected.
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<OAuthToken>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CredentialRecord {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, kind: CredentialKind) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            kind,
            label: String::new(),
            priority: 0,
            prefix: None,
            proxy_url: None,
            base_url: None,
            extra_headers: HashMap::new(),
            disabled: false,
            api_key: None,
            token: None,
            extra: Map::new(),
        }
    }
}
