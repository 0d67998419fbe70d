//! Per-provider configuration.
//!
//! Families sharing the OpenAI wire dialect (qwen, kimi, iflow, copilot) are
//! data over one generic implementation, not separate code paths.

use serde::{Deserialize, Serialize};

use crate::Proto;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    Gemini,
    Claude,
    Codex,
    Kiro,
    Vertex,
    Qwen,
    Kimi,
    IFlow,
    Copilot,
    Antigravity,
    OpenAI,
}

impl ProviderFamily {
    pub fn tag(&self) -> &'static str {
        match self {
            ProviderFamily::Gemini => "gemini",
            ProviderFamily::Claude => "claude",
            ProviderFamily::Codex => "codex",
            ProviderFamily::Kiro => "kiro",
            ProviderFamily::Vertex => "vertex",
            ProviderFamily::Qwen => "qwen",
            ProviderFamily::Kimi => "kimi",
            ProviderFamily::IFlow => "iflow",
            ProviderFamily::Copilot => "copilot",
            ProviderFamily::Antigravity => "antigravity",
            ProviderFamily::OpenAI => "openai",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "gemini" => Some(ProviderFamily::Gemini),
            "claude" => Some(ProviderFamily::Claude),
            "codex" => Some(ProviderFamily::Codex),
            "kiro" => Some(ProviderFamily::Kiro),
            "vertex" => Some(ProviderFamily::Vertex),
            "qwen" => Some(ProviderFamily::Qwen),
            "kimi" => Some(ProviderFamily::Kimi),
            "iflow" => Some(ProviderFamily::IFlow),
            "copilot" => Some(ProviderFamily::Copilot),
            "antigravity" => Some(ProviderFamily::Antigravity),
            "openai" => Some(ProviderFamily::OpenAI),
            _ => None,
        }
    }

    /// Wire dialect the family speaks upstream.
    pub fn proto(&self) -> Proto {
        match self {
            ProviderFamily::Gemini | ProviderFamily::Vertex | ProviderFamily::Antigravity => {
                Proto::Gemini
            }
            ProviderFamily::Claude | ProviderFamily::Kiro => Proto::Claude,
            ProviderFamily::Codex
            | ProviderFamily::Qwen
            | ProviderFamily::Kimi
            | ProviderFamily::IFlow
            | ProviderFamily::Copilot
            | ProviderFamily::OpenAI => Proto::OpenAI,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    Gemini(GeminiConfig),
    Claude(ClaudeConfig),
    Codex(OpenAiCompatConfig),
    Kiro(KiroConfig),
    Vertex(GeminiConfig),
    Qwen(OpenAiCompatConfig),
    Kimi(OpenAiCompatConfig),
    IFlow(OpenAiCompatConfig),
    Copilot(OpenAiCompatConfig),
    Antigravity(GeminiConfig),
    OpenAI(OpenAiCompatConfig),
}

impl ProviderConfig {
    pub fn family(&self) -> ProviderFamily {
        match self {
            ProviderConfig::Gemini(_) => ProviderFamily::Gemini,
            ProviderConfig::Claude(_) => ProviderFamily::Claude,
            ProviderConfig::Codex(_) => ProviderFamily::Codex,
            ProviderConfig::Kiro(_) => ProviderFamily::Kiro,
            ProviderConfig::Vertex(_) => ProviderFamily::Vertex,
            ProviderConfig::Qwen(_) => ProviderFamily::Qwen,
            ProviderConfig::Kimi(_) => ProviderFamily::Kimi,
            ProviderConfig::IFlow(_) => ProviderFamily::IFlow,
            ProviderConfig::Copilot(_) => ProviderFamily::Copilot,
            ProviderConfig::Antigravity(_) => ProviderFamily::Antigravity,
            ProviderConfig::OpenAI(_) => ProviderFamily::OpenAI,
        }
    }

    pub fn base_url(&self) -> Option<&str> {
        match self {
            ProviderConfig::Gemini(c)
            | ProviderConfig::Vertex(c)
            | ProviderConfig::Antigravity(c) => c.base_url.as_deref(),
            ProviderConfig::Claude(c) => c.base_url.as_deref(),
            ProviderConfig::Kiro(c) => c.base_url.as_deref(),
            ProviderConfig::Codex(c)
            | ProviderConfig::Qwen(c)
            | ProviderConfig::Kimi(c)
            | ProviderConfig::IFlow(c)
            | ProviderConfig::Copilot(c)
            | ProviderConfig::OpenAI(c) => c.base_url.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeminiConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaudeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenAiCompatConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KiroConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Desktop auth endpoint for social login/refresh.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_base_url: Option<String>,
    /// AWS SSO-OIDC region for builder-id / IDC flows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oidc_region: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_map_to_their_wire_dialects() {
        assert_eq!(ProviderFamily::Kiro.proto(), Proto::Claude);
        assert_eq!(ProviderFamily::Antigravity.proto(), Proto::Gemini);
        assert_eq!(ProviderFamily::Qwen.proto(), Proto::OpenAI);
    }

    #[test]
    fn config_round_trips_with_kind_tag() {
        let config = ProviderConfig::Kiro(KiroConfig {
            base_url: Some("https://codewhisperer.us-east-1.amazonaws.com".to_string()),
            auth_base_url: None,
            oidc_region: Some("us-east-1".to_string()),
        });
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["kind"], "kiro");
        let back: ProviderConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back.family(), ProviderFamily::Kiro);
    }
}
