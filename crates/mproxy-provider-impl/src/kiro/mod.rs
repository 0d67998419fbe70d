//! Kiro credential flows: social OAuth (Google/GitHub via the desktop auth
//! service), AWS Builder ID and Identity Center over SSO-OIDC.

pub mod fingerprint;
pub mod oauth;
pub mod sso;

pub use fingerprint::kiro_user_agent;

use mproxy_provider_core::{OAuthToken, ProviderResult};

/// Refresh dispatch by auth method, mirroring how the tokens were minted:
/// `idc` and `builder-id` refresh against SSO-OIDC, everything else against
/// the social `/refreshToken` endpoint.
pub async fn refresh_token(
    proxy: Option<&str>,
    auth_base_url: &str,
    token: &OAuthToken,
    token_key: &str,
) -> ProviderResult<OAuthToken> {
    let method = token
        .auth_method
        .as_deref()
        .unwrap_or("social")
        .to_ascii_lowercase();
    match method.as_str() {
        "idc" => {
            sso::refresh_with_region(
                proxy,
                token,
                token.region.as_deref().unwrap_or(sso::DEFAULT_REGION),
            )
            .await
        }
        "builder-id" => sso::refresh_with_region(proxy, token, sso::DEFAULT_REGION).await,
        _ => oauth::refresh_social(proxy, auth_base_url, token, token_key).await,
    }
}
