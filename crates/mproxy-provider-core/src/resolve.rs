//! Model-name resolution: thinking suffixes, Amp mappings, OAuth aliases,
//! exclusion patterns and `auto` expansion.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::cooldown::CooldownTracker;
use crate::registry::ModelRegistry;

/// Trailing `(...)` annotation on a model name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThinkingSuffix {
    None,
    /// Raw token budget, e.g. `gemini-2.5-pro(8192)`.
    Budget(i64),
    Auto,
    /// One of low / medium / high / ultra.
    Level(String),
}

impl ThinkingSuffix {
    pub fn is_some(&self) -> bool {
        !matches!(self, ThinkingSuffix::None)
    }
}

const LEVELS: &[&str] = &["low", "medium", "high", "ultra"];

/// Split `base(payload)`; an unrecognized payload leaves the name untouched.
pub fn parse_suffix(raw: &str) -> (String, ThinkingSuffix) {
    let trimmed = raw.trim();
    if let Some(open) = trimmed.rfind('(')
        && trimmed.ends_with(')')
        && open > 0
    {
        let base = &trimmed[..open];
        let payload = &trimmed[open + 1..trimmed.len() - 1];
        if payload.eq_ignore_ascii_case("auto") {
            return (base.to_string(), ThinkingSuffix::Auto);
        }
        if LEVELS.iter().any(|l| payload.eq_ignore_ascii_case(l)) {
            return (base.to_string(), ThinkingSuffix::Level(payload.to_lowercase()));
        }
        if let Ok(budget) = payload.parse::<i64>() {
            return (base.to_string(), ThinkingSuffix::Budget(budget));
        }
    }
    (trimmed.to_string(), ThinkingSuffix::None)
}

pub fn render_suffix(base: &str, suffix: &ThinkingSuffix) -> String {
    match suffix {
        ThinkingSuffix::None => base.to_string(),
        ThinkingSuffix::Budget(budget) => format!("{base}({budget})"),
        ThinkingSuffix::Auto => format!("{base}(auto)"),
        ThinkingSuffix::Level(level) => format!("{base}({level})"),
    }
}

#[derive(Debug, Clone)]
pub struct AmpMapping {
    pub from: String,
    pub to: String,
    /// When set, `from` is a regular expression instead of an exact name.
    pub is_regex: bool,
}

#[derive(Debug, Clone)]
pub struct OAuthAlias {
    /// Upstream model name.
    pub name: String,
    /// Advertised name.
    pub alias: String,
    /// fork=true advertises both `name` and `alias`; fork=false replaces
    /// `name` with `alias`.
    pub fork: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ResolverTables {
    pub amp_mappings: Vec<AmpMapping>,
    /// Per-provider alias lists.
    pub aliases: HashMap<String, Vec<OAuthAlias>>,
    /// Per-provider exclusion patterns: exact, `prefix*`, `*suffix`, `*infix*`.
    pub exclusions: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub requested: String,
    /// Canonical base used for registry lookups.
    pub base: String,
    pub suffix: ThinkingSuffix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    NotFound,
    Excluded,
}

pub struct ModelResolver {
    registry: Arc<ModelRegistry>,
    tables: ResolverTables,
    auto_preference: Vec<String>,
}

impl ModelResolver {
    pub fn new(
        registry: Arc<ModelRegistry>,
        tables: ResolverTables,
        auto_preference: Vec<String>,
    ) -> Self {
        Self {
            registry,
            tables,
            auto_preference,
        }
    }

    /// Resolve a requested model to its canonical base + suffix.
    ///
    /// Order: suffix parse, `auto` expansion, Amp mapping, exclusion check.
    /// Exclusion runs after mapping: a mapping whose target is excluded
    /// fails, while the raw inbound name is only checked post-mapping.
    pub fn resolve(&self, requested: &str) -> Result<ResolvedModel, ResolveError> {
        let (mut base, mut suffix) = parse_suffix(requested);

        if base == "auto" {
            base = self.resolve_auto().ok_or(ResolveError::NotFound)?;
        }

        if let Some((mapped_base, mapped_suffix)) = self.apply_amp_mapping(&base) {
            base = mapped_base;
            if mapped_suffix.is_some() {
                suffix = mapped_suffix;
            }
        }

        if self.excluded_for_all_providers(&base) {
            return Err(ResolveError::Excluded);
        }

        Ok(ResolvedModel {
            requested: requested.to_string(),
            base,
            suffix,
        })
    }

    /// First preference class with at least one Ready client; registration
    /// order breaks ties inside a class.
    fn resolve_auto(&self) -> Option<String> {
        let cooldown = self.registry.cooldown();
        for preference in &self.auto_preference {
            for model_id in self.registry.model_ids() {
                if model_id != *preference && !model_id.starts_with(preference.as_str()) {
                    continue;
                }
                let ready = self
                    .registry
                    .candidates(&model_id)
                    .iter()
                    .any(|client| cooldown.state(client, &model_id).is_ready());
                if ready {
                    return Some(model_id);
                }
            }
        }
        None
    }

    /// Exact mappings take precedence over regex mappings; a mapping applies
    /// only if its target resolves to at least one registered provider.
    fn apply_amp_mapping(&self, base: &str) -> Option<(String, ThinkingSuffix)> {
        let exact = self
            .tables
            .amp_mappings
            .iter()
            .filter(|m| !m.is_regex)
            .find(|m| m.from == base);
        let matched = exact.or_else(|| {
            self.tables.amp_mappings.iter().filter(|m| m.is_regex).find(|m| {
                Regex::new(&m.from)
                    .map(|re| re.is_match(base))
                    .unwrap_or(false)
            })
        })?;

        let (to_base, to_suffix) = parse_suffix(&matched.to);
        if self.registry.providers(&to_base).is_empty() {
            return None;
        }
        Some((to_base, to_suffix))
    }

    pub fn is_excluded(&self, provider: &str, model: &str) -> bool {
        self.tables
            .exclusions
            .get(provider)
            .is_some_and(|patterns| patterns.iter().any(|p| pattern_matches(p, model)))
    }

    fn excluded_for_all_providers(&self, model: &str) -> bool {
        let providers = self.registry.providers(model);
        if providers.is_empty() {
            return false;
        }
        providers
            .iter()
            .all(|provider| self.is_excluded(provider, model))
    }

    /// Names a provider should advertise for one upstream model, honoring
    /// alias/fork entries.
    pub fn advertised_names(&self, provider: &str, name: &str) -> Vec<String> {
        let Some(aliases) = self.tables.aliases.get(provider) else {
            return vec![name.to_string()];
        };
        match aliases.iter().find(|a| a.name == name) {
            Some(alias) if alias.fork => vec![name.to_string(), alias.alias.clone()],
            Some(alias) => vec![alias.alias.clone()],
            None => vec![name.to_string()],
        }
    }

    /// Rewrite an advertised model back to the provider's upstream name.
    pub fn rewrite_for_upstream(&self, model: &str, provider: &str) -> String {
        if let Some(aliases) = self.tables.aliases.get(provider)
            && let Some(alias) = aliases.iter().find(|a| a.alias == model)
        {
            return alias.name.clone();
        }
        model.to_string()
    }

    /// Clients serving the model whose provider has not excluded it.
    pub fn selectable_candidates(&self, model: &str) -> Vec<crate::client::ClientId> {
        self.registry
            .candidates(model)
            .into_iter()
            .filter(|client| {
                let provider = self.registry.client_provider(client).unwrap_or_default();
                !self.is_excluded(&provider, model)
            })
            .collect()
    }

    pub fn cooldown(&self) -> &Arc<CooldownTracker> {
        self.registry.cooldown()
    }
}

/// Exclusion pattern match: exact, `prefix*`, `*suffix`, `*infix*`.
fn pattern_matches(pattern: &str, model: &str) -> bool {
    let starts_wild = pattern.starts_with('*');
    let ends_wild = pattern.ends_with('*');
    let inner = pattern.trim_matches('*');
    match (starts_wild, ends_wild) {
        (false, false) => model == pattern,
        (false, true) => model.starts_with(inner),
        (true, false) => model.ends_with(inner),
        (true, true) => model.contains(inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ModelInfo, ThinkingSupport};

    fn info(id: &str, family: &str) -> ModelInfo {
        ModelInfo {
            id: id.to_string(),
            display_name: id.to_string(),
            family: family.to_string(),
            context_length: 1_000_000,
            max_output_tokens: 65_536,
            supported_methods: Vec::new(),
            thinking: ThinkingSupport::FixedBudget,
        }
    }

    fn resolver_with(tables: ResolverTables) -> ModelResolver {
        let registry = Arc::new(ModelRegistry::new(Arc::new(CooldownTracker::new())));
        registry.register("g1", "gemini", vec![info("gemini-2.5-pro", "gemini")]);
        registry.register(
            "g1",
            "gemini",
            vec![info("gemini-claude-opus-4-5-thinking", "gemini")],
        );
        registry.register("c1", "claude", vec![info("claude-sonnet-4-5", "claude")]);
        ModelResolver::new(
            registry,
            tables,
            vec!["gemini-2.5-pro".to_string(), "claude-sonnet-4-5".to_string()],
        )
    }

    #[test]
    fn suffix_parse_handles_all_payload_kinds() {
        assert_eq!(
            parse_suffix("gemini-2.5-pro(8192)"),
            ("gemini-2.5-pro".to_string(), ThinkingSuffix::Budget(8192))
        );
        assert_eq!(
            parse_suffix("m(auto)"),
            ("m".to_string(), ThinkingSuffix::Auto)
        );
        assert_eq!(
            parse_suffix("m(HIGH)"),
            ("m".to_string(), ThinkingSuffix::Level("high".to_string()))
        );
        // Unrecognized payload stays part of the name.
        assert_eq!(
            parse_suffix("model(v2)"),
            ("model(v2)".to_string(), ThinkingSuffix::None)
        );
    }

    #[test]
    fn suffix_round_trips() {
        for raw in ["m", "m(1024)", "m(auto)", "m(low)"] {
            let (base, suffix) = parse_suffix(raw);
            assert_eq!(parse_suffix(&render_suffix(&base, &suffix)), (base, suffix));
        }
    }

    #[test]
    fn amp_mapping_applies_when_target_registered() {
        let resolver = resolver_with(ResolverTables {
            amp_mappings: vec![AmpMapping {
                from: "claude-opus-4-5".to_string(),
                to: "gemini-claude-opus-4-5-thinking".to_string(),
                is_regex: false,
            }],
            ..Default::default()
        });
        let resolved = resolver.resolve("claude-opus-4-5").unwrap();
        assert_eq!(resolved.base, "gemini-claude-opus-4-5-thinking");
    }

    #[test]
    fn amp_mapping_skipped_when_target_unregistered() {
        let resolver = resolver_with(ResolverTables {
            amp_mappings: vec![AmpMapping {
                from: "claude-sonnet-4-5".to_string(),
                to: "no-such-model".to_string(),
                is_regex: false,
            }],
            ..Default::default()
        });
        let resolved = resolver.resolve("claude-sonnet-4-5").unwrap();
        assert_eq!(resolved.base, "claude-sonnet-4-5");
    }

    #[test]
    fn amp_mapping_preserves_caller_suffix_unless_target_has_one() {
        let resolver = resolver_with(ResolverTables {
            amp_mappings: vec![
                AmpMapping {
                    from: "a".to_string(),
                    to: "gemini-2.5-pro".to_string(),
                    is_regex: false,
                },
                AmpMapping {
                    from: "b".to_string(),
                    to: "gemini-2.5-pro(4096)".to_string(),
                    is_regex: false,
                },
            ],
            ..Default::default()
        });
        let kept = resolver.resolve("a(1234)").unwrap();
        assert_eq!(kept.suffix, ThinkingSuffix::Budget(1234));
        let overridden = resolver.resolve("b(1234)").unwrap();
        assert_eq!(overridden.suffix, ThinkingSuffix::Budget(4096));
    }

    #[test]
    fn exact_mapping_beats_regex() {
        let resolver = resolver_with(ResolverTables {
            amp_mappings: vec![
                AmpMapping {
                    from: "^claude-.*$".to_string(),
                    to: "gemini-2.5-pro".to_string(),
                    is_regex: true,
                },
                AmpMapping {
                    from: "claude-opus-4-5".to_string(),
                    to: "claude-sonnet-4-5".to_string(),
                    is_regex: false,
                },
            ],
            ..Default::default()
        });
        let resolved = resolver.resolve("claude-opus-4-5").unwrap();
        assert_eq!(resolved.base, "claude-sonnet-4-5");
    }

    #[test]
    fn exclusion_patterns_cover_all_shapes() {
        assert!(pattern_matches("m", "m"));
        assert!(pattern_matches("gemini-*", "gemini-2.5-pro"));
        assert!(pattern_matches("*-preview", "gemini-3-preview"));
        assert!(pattern_matches("*flash*", "gemini-2.5-flash-lite"));
        assert!(!pattern_matches("gemini-*", "claude-sonnet"));
    }

    #[test]
    fn excluded_model_is_rejected_after_mapping() {
        let mut exclusions = HashMap::new();
        exclusions.insert("claude".to_string(), vec!["claude-sonnet-*".to_string()]);
        let resolver = resolver_with(ResolverTables {
            exclusions,
            ..Default::default()
        });
        assert_eq!(
            resolver.resolve("claude-sonnet-4-5"),
            Err(ResolveError::Excluded)
        );
    }

    #[test]
    fn auto_expands_to_first_ready_preference() {
        let resolver = resolver_with(ResolverTables::default());
        let resolved = resolver.resolve("auto").unwrap();
        assert_eq!(resolved.base, "gemini-2.5-pro");

        // Cool the gemini client; auto falls through to the claude class.
        resolver.cooldown().mark_quota("g1", "gemini-2.5-pro");
        let resolved = resolver.resolve("auto").unwrap();
        assert_eq!(resolved.base, "claude-sonnet-4-5");
    }

    #[test]
    fn alias_fork_advertises_both_and_routes_to_upstream_name() {
        let mut aliases = HashMap::new();
        aliases.insert(
            "gemini".to_string(),
            vec![
                OAuthAlias {
                    name: "gemini-2.5-pro".to_string(),
                    alias: "gemini-pro-latest".to_string(),
                    fork: true,
                },
                OAuthAlias {
                    name: "gemini-old".to_string(),
                    alias: "gemini-renamed".to_string(),
                    fork: false,
                },
            ],
        );
        let resolver = resolver_with(ResolverTables {
            aliases,
            ..Default::default()
        });
        assert_eq!(
            resolver.advertised_names("gemini", "gemini-2.5-pro"),
            vec!["gemini-2.5-pro".to_string(), "gemini-pro-latest".to_string()]
        );
        assert_eq!(
            resolver.advertised_names("gemini", "gemini-old"),
            vec!["gemini-renamed".to_string()]
        );
        assert_eq!(
            resolver.rewrite_for_upstream("gemini-pro-latest", "gemini"),
            "gemini-2.5-pro"
        );
        assert_eq!(
            resolver.rewrite_for_upstream("gemini-renamed", "gemini"),
            "gemini-old"
        );
    }
}
