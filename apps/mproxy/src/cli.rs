use std::collections::HashMap;

use clap::Parser;
use serde::Deserialize;

use mproxy_common::{GlobalConfigPatch, RateLimitConfig, RoutingConfig};
use mproxy_provider_core::{
    AmpMapping, OAuthAlias, PayloadRule, PayloadRules, ProviderConfig, ResolverTables,
};

#[derive(Debug, Parser)]
#[command(name = "mproxy", about = "Multi-provider AI API gateway")]
pub struct Cli {
    /// Path to the JSON config file.
    #[arg(long, env = "MPROXY_CONFIG")]
    pub config: Option<String>,

    #[arg(long, env = "MPROXY_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "MPROXY_PORT")]
    pub port: Option<u16>,

    /// Directory holding one JSON file per credential.
    #[arg(long, env = "MPROXY_AUTH_DIR")]
    pub auth_dir: Option<String>,

    /// Inbound API key; repeatable.
    #[arg(long = "api-key")]
    pub api_keys: Vec<String>,

    #[arg(long, env = "MPROXY_MANAGEMENT_KEY")]
    pub management_key: Option<String>,

    /// Outbound proxy URL for upstream egress.
    #[arg(long, env = "MPROXY_PROXY")]
    pub proxy: Option<String>,
}

/// On-disk config file: the global patch plus routing tables.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub auth_dir: Option<String>,
    #[serde(default)]
    pub api_keys: Vec<String>,
    pub management_key: Option<String>,
    pub proxy: Option<String>,
    pub routing: Option<RoutingConfig>,
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub amp_mappings: Vec<AmpMappingEntry>,
    #[serde(default)]
    pub oauth_aliases: HashMap<String, Vec<OAuthAliasEntry>>,
    #[serde(default)]
    pub excluded_models: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub payload_rules: Vec<PayloadRule>,
}

#[derive(Debug, Deserialize)]
pub struct AmpMappingEntry {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub regex: bool,
}

#[derive(Debug, Deserialize)]
pub struct OAuthAliasEntry {
    pub name: String,
    pub alias: String,
    #[serde(default)]
    pub fork: bool,
}

impl ConfigFile {
    pub fn global_patch(&self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: self.host.clone(),
            port: self.port,
            auth_dir: self.auth_dir.clone(),
            api_keys: if self.api_keys.is_empty() {
                None
            } else {
                Some(self.api_keys.clone())
            },
            management_key: self.management_key.clone(),
            proxy: self.proxy.clone(),
            routing: self.routing.clone(),
            rate_limit: self.rate_limit.clone(),
        }
    }

    pub fn resolver_tables(&self) -> ResolverTables {
        ResolverTables {
            amp_mappings: self
                .amp_mappings
                .iter()
                .map(|entry| AmpMapping {
                    from: entry.from.clone(),
                    to: entry.to.clone(),
                    is_regex: entry.regex,
                })
                .collect(),
            aliases: self
                .oauth_aliases
                .iter()
                .map(|(provider, entries)| {
                    (
                        provider.clone(),
                        entries
                            .iter()
                            .map(|entry| OAuthAlias {
                                name: entry.name.clone(),
                                alias: entry.alias.clone(),
                                fork: entry.fork,
                            })
                            .collect(),
                    )
                })
                .collect(),
            exclusions: self.excluded_models.clone(),
        }
    }

    pub fn payload_rules(&self) -> PayloadRules {
        PayloadRules::new(self.payload_rules.clone())
    }
}

impl Cli {
    pub fn global_patch(&self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: self.host.clone(),
            port: self.port,
            auth_dir: self.auth_dir.clone(),
            api_keys: if self.api_keys.is_empty() {
                None
            } else {
                Some(self.api_keys.clone())
            },
            management_key: self.management_key.clone(),
            proxy: self.proxy.clone(),
            routing: None,
            rate_limit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_parses_routing_tables() {
        let raw = r#"{
            "auth-dir": "/var/lib/mproxy/auths",
            "api-keys": ["sk-inbound"],
            "amp-mappings": [
                {"from": "claude-opus-4-5", "to": "gemini-claude-opus-4-5-thinking"}
            ],
            "oauth-aliases": {
                "gemini": [{"name": "gemini-2.5-pro", "alias": "gemini-pro-latest", "fork": true}]
            },
            "excluded-models": {"kiro": ["*-preview"]},
            "payload-rules": [
                {"kind": "default", "models": "gemini-*",
                 "path": "generationConfig.thinkingConfig.thinkingBudget", "value": 8192}
            ]
        }"#;
        let file: ConfigFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.api_keys.len(), 1);
        let tables = file.resolver_tables();
        assert_eq!(tables.amp_mappings.len(), 1);
        assert!(tables.aliases["gemini"][0].fork);
        assert_eq!(tables.exclusions["kiro"][0], "*-preview");
        assert_eq!(file.payload_rules().rules.len(), 1);
    }
}
