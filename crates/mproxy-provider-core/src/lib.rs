//! Core routing abstractions for mproxy.
//!
//! This crate does not depend on axum or any concrete HTTP client. Provider
//! implementations construct `UpstreamHttpRequest`s; a higher layer performs
//! the IO.

pub mod client;
pub mod config;
pub mod cooldown;
pub mod errors;
pub mod payload_rules;
pub mod pool;
pub mod provider;
pub mod rate_limit;
pub mod registry;
pub mod resolve;
pub mod selector;

pub use client::{ClientHandle, ClientId, CredentialKind, OAuthToken, SharedClient, TokenSnapshot};
pub use config::{ProviderConfig, ProviderFamily};
pub use cooldown::{CooldownState, CooldownTracker, QUOTA_COOLDOWN, QUOTA_REASON};
pub use errors::{ProviderError, ProviderResult};
pub use payload_rules::{PayloadRule, PayloadRuleKind, PayloadRules};
pub use pool::{ClientPool, SharedClientPool};
pub use provider::{
    default_unavailable, header_get, header_set, ByteStream, Headers, QuotaSignal,
    UnavailableDecision, UpstreamBody, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamProvider, UpstreamTransportErrorKind,
};
pub use rate_limit::{RateLimiter, TokenStateSnapshot};
pub use registry::{ModelInfo, ModelRegistry, ThinkingSupport, UnavailableModel};
pub use resolve::{
    parse_suffix, render_suffix, AmpMapping, ModelResolver, OAuthAlias, ResolveError,
    ResolvedModel, ResolverTables, ThinkingSuffix,
};
pub use selector::{Candidate, InFlightGuard, SelectPolicy, Selector};

// Re-export the dialect enum used throughout the routing layer.
pub use mproxy_transform::Proto;
