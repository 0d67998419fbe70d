//! AWS SSO-OIDC flows backing Kiro Builder ID and Identity Center logins.
//!
//! Device flow: RegisterClient -> StartDeviceAuthorization -> poll
//! CreateToken until the user approves. `authorization_pending` keeps the
//! interval, `slow_down` stretches it by five seconds.

use serde_json::json;
use time::OffsetDateTime;

use mproxy_provider_core::{OAuthToken, ProviderError, ProviderResult};

use super::fingerprint::kiro_user_agent;
use crate::http::post_json;

pub const DEFAULT_REGION: &str = "us-east-1";
const CLIENT_NAME: &str = "Kiro IDE";
const BUILDER_ID_START_URL: &str = "https://view.awsapps.com/start";
const SCOPES: &[&str] = &["codewhisperer:completions", "codewhisperer:analysis"];
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const IDC_AMZ_USER_AGENT: &str = "aws-sdk-js/3.738.0 ua/2.1 os/other lang/js md/browser";

fn oidc_endpoint(region: &str) -> String {
    format!("https://oidc.{region}.amazonaws.com")
}

fn codewhisperer_endpoint(region: &str) -> String {
    format!("https://codewhisperer.{region}.amazonaws.com")
}

#[derive(Debug, Clone)]
pub struct RegisteredClient {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub interval_secs: u64,
    pub expires_in_secs: u64,
}

pub async fn register_client(
    proxy: Option<&str>,
    region: &str,
) -> ProviderResult<RegisteredClient> {
    let resp = post_json(
        proxy,
        &format!("{}/client/register", oidc_endpoint(region)),
        &[("user-agent", kiro_user_agent(""))],
        &json!({
            "clientName": CLIENT_NAME,
            "clientType": "public",
            "scopes": SCOPES,
        }),
    )
    .await?;
    if !resp.is_success() {
        return Err(ProviderError::Other(format!(
            "client registration failed (status {})",
            resp.status
        )));
    }
    let value = resp.json()?;
    Ok(RegisteredClient {
        client_id: string_field(&value, "clientId")?,
        client_secret: string_field(&value, "clientSecret")?,
    })
}

pub async fn start_device_authorization(
    proxy: Option<&str>,
    region: &str,
    client: &RegisteredClient,
    start_url: Option<&str>,
) -> ProviderResult<DeviceAuthorization> {
    let resp = post_json(
        proxy,
        &format!("{}/device_authorization", oidc_endpoint(region)),
        &[("user-agent", kiro_user_agent(""))],
        &json!({
            "clientId": client.client_id,
            "clientSecret": client.client_secret,
            "startUrl": start_url.unwrap_or(BUILDER_ID_START_URL),
        }),
    )
    .await?;
    if !resp.is_success() {
        return Err(ProviderError::Other(format!(
            "device authorization failed (status {})",
            resp.status
        )));
    }
    let value = resp.json()?;
    Ok(DeviceAuthorization {
        device_code: string_field(&value, "deviceCode")?,
        user_code: string_field(&value, "userCode")?,
        verification_uri: string_field(&value, "verificationUri")?,
        verification_uri_complete: value
            .get("verificationUriComplete")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        interval_secs: value
            .get("interval")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        expires_in_secs: value
            .get("expiresIn")
            .and_then(|v| v.as_u64())
            .unwrap_or(600),
    })
}

enum PollOutcome {
    Pending,
    SlowDown,
    Token(serde_json::Value),
}

async fn create_token_once(
    proxy: Option<&str>,
    region: &str,
    client: &RegisteredClient,
    device_code: &str,
) -> ProviderResult<PollOutcome> {
    let resp = post_json(
        proxy,
        &format!("{}/token", oidc_endpoint(region)),
        &[("user-agent", kiro_user_agent(""))],
        &json!({
            "clientId": client.client_id,
            "clientSecret": client.client_secret,
            "deviceCode": device_code,
            "grantType": "urn:ietf:params:oauth:grant-type:device_code",
        }),
    )
    .await?;
    if resp.is_success() {
        return Ok(PollOutcome::Token(resp.json()?));
    }
    let error = resp
        .json()
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_default();
    match error.as_str() {
        "authorization_pending" => Ok(PollOutcome::Pending),
        "slow_down" => Ok(PollOutcome::SlowDown),
        other => Err(ProviderError::Other(format!(
            "token poll failed (status {}): {other}",
            resp.status
        ))),
    }
}

/// Poll CreateToken until approved, the deadline passes, or a terminal error.
pub async fn poll_device_token(
    proxy: Option<&str>,
    region: &str,
    client: &RegisteredClient,
    authorization: &DeviceAuthorization,
    start_url: Option<&str>,
) -> ProviderResult<OAuthToken> {
    let deadline = tokio::time::Instant::now()
        + std::time::Duration::from_secs(authorization.expires_in_secs);
    let mut interval = std::time::Duration::from_secs(
        authorization.interval_secs.max(DEFAULT_POLL_INTERVAL_SECS),
    );

    loop {
        if tokio::time::Instant::now() >= deadline {
            return Err(ProviderError::Other("device authorization expired".to_string()));
        }
        tokio::time::sleep(interval).await;
        match create_token_once(proxy, region, client, &authorization.device_code).await? {
            PollOutcome::Pending => {}
            PollOutcome::SlowDown => {
                interval += std::time::Duration::from_secs(5);
            }
            PollOutcome::Token(value) => {
                let auth_method = if start_url.is_some() { "idc" } else { "builder-id" };
                return token_from_oidc(
                    &value,
                    client,
                    region,
                    start_url,
                    auth_method,
                    None,
                );
            }
        }
    }
}

/// Builder ID login over the authorization-code grant: PKCE S256 plus the
/// local callback server. After the exchange the CodeWhisperer profile ARN
/// is resolved.
pub struct PendingAuthCodeLogin {
    pub authorize_url: String,
    client: RegisteredClient,
    region: String,
    login: super::oauth::PendingLogin,
}

pub async fn start_auth_code_login(
    proxy: Option<&str>,
    region: &str,
) -> ProviderResult<PendingAuthCodeLogin> {
    let client = register_client(proxy, region).await?;
    let (verifier, challenge) = super::oauth::generate_pkce();
    let state = super::oauth::generate_state();
    let (redirect_uri, rx) = super::oauth::bind_callback_server(&state).await?;

    let authorize_url = format!(
        "{}/authorize?response_type=code&client_id={}&redirect_uri={}&scopes={}&state={}&code_challenge={}&code_challenge_method=S256",
        oidc_endpoint(region),
        urlencoding::encode(&client.client_id),
        urlencoding::encode(&redirect_uri),
        urlencoding::encode(&SCOPES.join(" ")),
        state,
        challenge,
    );

    Ok(PendingAuthCodeLogin {
        authorize_url,
        client,
        region: region.to_string(),
        login: super::oauth::PendingLogin {
            login_url: String::new(),
            redirect_uri,
            verifier,
            expected_state: state,
            results: rx,
        },
    })
}

impl PendingAuthCodeLogin {
    pub async fn finish(self, proxy: Option<&str>) -> ProviderResult<OAuthToken> {
        let (code, verifier, redirect_uri) = self.login.wait_for_code().await?;
        let resp = post_json(
            proxy,
            &format!("{}/token", oidc_endpoint(&self.region)),
            &[("user-agent", kiro_user_agent(""))],
            &json!({
                "clientId": self.client.client_id,
                "clientSecret": self.client.client_secret,
                "grantType": "authorization_code",
                "code": code,
                "codeVerifier": verifier,
                "redirectUri": redirect_uri,
            }),
        )
        .await?;
        if !resp.is_success() {
            return Err(ProviderError::Other(format!(
                "auth code exchange failed (status {})",
                resp.status
            )));
        }
        let value = resp.json()?;
        let mut token =
            token_from_oidc(&value, &self.client, &self.region, None, "builder-id", None)?;
        token.profile_arn = fetch_profile_arn(proxy, &self.region, &token.access_token).await;
        Ok(token)
    }
}

/// Refresh a Builder ID / IDC token against SSO-OIDC.
pub async fn refresh_with_region(
    proxy: Option<&str>,
    token: &OAuthToken,
    region: &str,
) -> ProviderResult<OAuthToken> {
    let client_id = token
        .client_id
        .as_deref()
        .ok_or(ProviderError::MissingCredentialField("client_id"))?;
    let client_secret = token
        .client_secret
        .as_deref()
        .ok_or(ProviderError::MissingCredentialField("client_secret"))?;
    if token.refresh_token.is_empty() {
        return Err(ProviderError::MissingCredentialField("refresh_token"));
    }

    let resp = post_json(
        proxy,
        &format!("{}/token", oidc_endpoint(region)),
        &[
            ("user-agent", "node".to_string()),
            ("x-amz-user-agent", IDC_AMZ_USER_AGENT.to_string()),
        ],
        &json!({
            "clientId": client_id,
            "clientSecret": client_secret,
            "refreshToken": token.refresh_token,
            "grantType": "refresh_token",
        }),
    )
    .await?;
    if !resp.is_success() {
        return Err(ProviderError::Other(format!(
            "oidc refresh failed (status {}): {}",
            resp.status,
            String::from_utf8_lossy(&resp.body)
        )));
    }
    let value = resp.json()?;
    let registered = RegisteredClient {
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
    };
    token_from_oidc(
        &value,
        &registered,
        region,
        token.start_url.as_deref(),
        token.auth_method.as_deref().unwrap_or("builder-id"),
        Some(token),
    )
}

/// Resolve the CodeWhisperer profile ARN after an auth-code login:
/// ListProfiles first, ListAvailableCustomizations as the fallback.
pub async fn fetch_profile_arn(
    proxy: Option<&str>,
    region: &str,
    access_token: &str,
) -> Option<String> {
    for target in [
        "AmazonCodeWhispererService.ListProfiles",
        "AmazonCodeWhispererService.ListAvailableCustomizations",
    ] {
        let resp = post_json(
            proxy,
            &codewhisperer_endpoint(region),
            &[
                ("authorization", format!("Bearer {access_token}")),
                ("x-amz-target", target.to_string()),
                ("user-agent", kiro_user_agent("")),
            ],
            &json!({ "maxResults": 2 }),
        )
        .await;
        let Ok(resp) = resp else { continue };
        if !resp.is_success() {
            continue;
        }
        let Ok(value) = resp.json() else { continue };
        let arn = value
            .get("profiles")
            .or_else(|| value.get("customizations"))
            .and_then(|items| items.as_array())
            .and_then(|items| items.first())
            .and_then(|item| item.get("arn").or_else(|| item.get("profileArn")))
            .and_then(|v| v.as_str());
        if let Some(arn) = arn {
            return Some(arn.to_string());
        }
    }
    None
}

fn token_from_oidc(
    value: &serde_json::Value,
    client: &RegisteredClient,
    region: &str,
    start_url: Option<&str>,
    auth_method: &str,
    previous: Option<&OAuthToken>,
) -> ProviderResult<OAuthToken> {
    let access_token = string_field(value, "accessToken")?;
    let expires_in = value
        .get("expiresIn")
        .and_then(|v| v.as_i64())
        .filter(|v| *v > 0)
        .unwrap_or(3600);
    let refresh_token = value
        .get("refreshToken")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .or_else(|| previous.map(|p| p.refresh_token.clone()))
        .unwrap_or_default();

    Ok(OAuthToken {
        access_token,
        refresh_token,
        expires_at: OffsetDateTime::now_utc() + time::Duration::seconds(expires_in),
        client_id: Some(client.client_id.clone()),
        client_secret: Some(client.client_secret.clone()),
        start_url: start_url.map(String::from),
        region: Some(region.to_string()),
        profile_arn: previous.and_then(|p| p.profile_arn.clone()),
        auth_method: Some(auth_method.to_string()),
        last_verified: Some(OffsetDateTime::now_utc()),
    })
}

fn string_field(value: &serde_json::Value, key: &str) -> ProviderResult<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| ProviderError::Other(format!("missing field {key} in oidc response")))
}
