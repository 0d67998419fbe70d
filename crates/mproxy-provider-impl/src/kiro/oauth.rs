//! Kiro social login (Google/GitHub) with PKCE and a local callback server,
//! plus the `/refreshToken` refresh path.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde_json::json;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use mproxy_provider_core::{OAuthToken, ProviderError, ProviderResult};

use super::fingerprint::kiro_user_agent;
use crate::http::post_json;

pub const DEFAULT_AUTH_BASE_URL: &str = "https://prod.us-east-1.auth.desktop.kiro.dev";
const DEFAULT_CALLBACK_PORT: u16 = 9876;
const AUTH_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocialProvider {
    Google,
    GitHub,
}

impl SocialProvider {
    fn as_str(&self) -> &'static str {
        match self {
            SocialProvider::Google => "google",
            SocialProvider::GitHub => "github",
        }
    }
}

pub fn generate_pkce() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    (verifier, challenge)
}

pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Clone)]
pub struct CallbackResult {
    pub code: String,
    pub state: String,
}

/// A login attempt in progress: the URL to open and the callback channel.
pub struct PendingLogin {
    pub login_url: String,
    pub redirect_uri: String,
    pub(crate) verifier: String,
    pub(crate) expected_state: String,
    pub(crate) results: mpsc::Receiver<Result<CallbackResult, String>>,
}

/// Bind the loopback callback server on the default port (ephemeral
/// fallback) and start serving one callback for `expected_state`.
pub(crate) async fn bind_callback_server(
    expected_state: &str,
) -> ProviderResult<(String, mpsc::Receiver<Result<CallbackResult, String>>)> {
    let listener = match TcpListener::bind(("127.0.0.1", DEFAULT_CALLBACK_PORT)).await {
        Ok(listener) => listener,
        Err(_) => {
            tracing::warn!(
                port = DEFAULT_CALLBACK_PORT,
                "default callback port busy, using an ephemeral port"
            );
            TcpListener::bind(("127.0.0.1", 0))
                .await
                .map_err(|err| ProviderError::Other(format!("callback bind failed: {err}")))?
        }
    };
    let port = listener
        .local_addr()
        .map_err(|err| ProviderError::Other(err.to_string()))?
        .port();
    let redirect_uri = format!("http://localhost:{port}/oauth/callback");
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(serve_callback(listener, expected_state.to_string(), tx));
    Ok((redirect_uri, rx))
}

/// Start the social login flow: bind the loopback callback server and build
/// the provider login URL.
pub async fn start_social_login(
    auth_base_url: &str,
    provider: SocialProvider,
) -> ProviderResult<PendingLogin> {
    let (verifier, challenge) = generate_pkce();
    let state = generate_state();
    let (redirect_uri, rx) = bind_callback_server(&state).await?;

    let login_url = format!(
        "{auth_base_url}/login?provider={}&redirect_uri={}&code_challenge={}&code_challenge_method=S256&state={}",
        provider.as_str(),
        urlencoding::encode(&redirect_uri),
        challenge,
        state,
    );

    Ok(PendingLogin {
        login_url,
        redirect_uri,
        verifier,
        expected_state: state,
        results: rx,
    })
}

impl PendingLogin {
    /// Wait for the browser callback and hand back the verified code.
    pub(crate) async fn wait_for_code(mut self) -> ProviderResult<(String, String, String)> {
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(AUTH_TIMEOUT_SECS),
            self.results.recv(),
        )
        .await
        .map_err(|_| ProviderError::Other("login timed out".to_string()))?
        .ok_or_else(|| ProviderError::Other("callback server closed".to_string()))?
        .map_err(ProviderError::Other)?;
        if result.state != self.expected_state {
            return Err(ProviderError::Other("state mismatch".to_string()));
        }
        Ok((result.code, self.verifier, self.redirect_uri))
    }
}

impl PendingLogin {
    /// Wait for the browser callback and exchange the code for tokens.
    pub async fn finish(
        self,
        proxy: Option<&str>,
        auth_base_url: &str,
    ) -> ProviderResult<OAuthToken> {
        let (code, verifier, redirect_uri) = self.wait_for_code().await?;
        exchange_code(proxy, auth_base_url, &code, &verifier, &redirect_uri).await
    }
}

/// Minimal single-shot HTTP handler for the loopback redirect.
async fn serve_callback(
    listener: TcpListener,
    expected_state: String,
    tx: mpsc::Sender<Result<CallbackResult, String>>,
) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(AUTH_TIMEOUT_SECS);
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = tokio::time::sleep_until(deadline) => return,
        };
        let Ok((mut stream, _)) = accepted else {
            return;
        };
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        let request = String::from_utf8_lossy(&buf[..n]);
        let Some(query) = request
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .filter(|path| path.starts_with("/oauth/callback"))
            .and_then(|path| path.split_once('?').map(|(_, q)| q.to_string()))
        else {
            let _ = stream
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                .await;
            continue;
        };

        let code = query_value(&query, "code");
        let state = query_value(&query, "state");
        let error = query_value(&query, "error");

        let (status, page, outcome) = match (error, code, state) {
            (Some(message), _, _) => (
                "400 Bad Request",
                "<html><body><h1>Login Failed</h1><p>You can close this window.</p></body></html>",
                Some(Err(message)),
            ),
            (None, Some(code), Some(state)) if state == expected_state => (
                "200 OK",
                "<html><body><h1>Login Successful!</h1><p>You can close this window and return to the terminal.</p></body></html>",
                Some(Ok(CallbackResult { code, state })),
            ),
            _ => (
                "400 Bad Request",
                "<html><body><h1>Login Failed</h1><p>Invalid state parameter.</p></body></html>",
                Some(Err("state mismatch".to_string())),
            ),
        };

        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: text/html\r\ncontent-length: {}\r\n\r\n{page}",
            page.len()
        );
        let _ = stream.write_all(response.as_bytes()).await;
        if let Some(outcome) = outcome {
            let _ = tx.send(outcome).await;
            return;
        }
    }
}

fn query_value(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        let mut iter = pair.splitn(2, '=');
        if iter.next() != Some(key) {
            continue;
        }
        let value = iter.next().unwrap_or_default();
        return urlencoding::decode(value)
            .ok()
            .map(|v| v.into_owned())
            .filter(|v| !v.is_empty());
    }
    None
}

async fn exchange_code(
    proxy: Option<&str>,
    auth_base_url: &str,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> ProviderResult<OAuthToken> {
    let resp = post_json(
        proxy,
        &format!("{auth_base_url}/oauth/token"),
        &[("user-agent", kiro_user_agent(""))],
        &json!({
            "code": code,
            "code_verifier": verifier,
            "redirect_uri": redirect_uri,
        }),
    )
    .await?;
    if !resp.is_success() {
        return Err(ProviderError::Other(format!(
            "token exchange failed (status {})",
            resp.status
        )));
    }
    token_from_response(&resp.json()?, None)
}

/// Refresh an access token through `/refreshToken`, presenting the
/// fingerprinted KiroIDE User-Agent tied to this credential.
pub async fn refresh_social(
    proxy: Option<&str>,
    auth_base_url: &str,
    token: &OAuthToken,
    token_key: &str,
) -> ProviderResult<OAuthToken> {
    if token.refresh_token.is_empty() {
        return Err(ProviderError::MissingCredentialField("refresh_token"));
    }
    let resp = post_json(
        proxy,
        &format!("{auth_base_url}/refreshToken"),
        &[("user-agent", kiro_user_agent(token_key))],
        &json!({ "refreshToken": token.refresh_token }),
    )
    .await?;
    if !resp.is_success() {
        return Err(ProviderError::Other(format!(
            "token refresh failed (status {}): {}",
            resp.status,
            String::from_utf8_lossy(&resp.body)
        )));
    }
    token_from_response(&resp.json()?, Some(token))
}

/// Build an OAuthToken from a Kiro token endpoint response, carrying over
/// fields the endpoint does not return.
fn token_from_response(
    value: &serde_json::Value,
    previous: Option<&OAuthToken>,
) -> ProviderResult<OAuthToken> {
    let access_token = value
        .get("accessToken")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .ok_or(ProviderError::MissingCredentialField("accessToken"))?;
    let expires_in = value
        .get("expiresIn")
        .and_then(|v| v.as_i64())
        .filter(|v| *v > 0)
        .unwrap_or(3600);
    let refresh_token = value
        .get("refreshToken")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .or_else(|| previous.map(|p| p.refresh_token.clone()))
        .unwrap_or_default();

    Ok(OAuthToken {
        access_token: access_token.to_string(),
        refresh_token,
        expires_at: OffsetDateTime::now_utc() + time::Duration::seconds(expires_in),
        client_id: previous.and_then(|p| p.client_id.clone()),
        client_secret: previous.and_then(|p| p.client_secret.clone()),
        start_url: previous.and_then(|p| p.start_url.clone()),
        region: previous
            .and_then(|p| p.region.clone())
            .or_else(|| Some("us-east-1".to_string())),
        profile_arn: value
            .get("profileArn")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .or_else(|| previous.and_then(|p| p.profile_arn.clone())),
        auth_method: previous
            .and_then(|p| p.auth_method.clone())
            .or_else(|| Some("social".to_string())),
        last_verified: Some(OffsetDateTime::now_utc()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_is_s256_of_verifier() {
        let (verifier, challenge) = generate_pkce();
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        assert_eq!(challenge, expected);
    }

    #[test]
    fn token_response_falls_back_to_previous_fields() {
        let previous = OAuthToken {
            access_token: "old".to_string(),
            refresh_token: "refresh-1".to_string(),
            expires_at: OffsetDateTime::now_utc(),
            client_id: None,
            client_secret: None,
            start_url: None,
            region: Some("eu-west-1".to_string()),
            profile_arn: Some("arn:aws:codewhisperer:p/1".to_string()),
            auth_method: Some("social".to_string()),
            last_verified: None,
        };
        let token = token_from_response(
            &json!({"accessToken": "new", "expiresIn": 1800}),
            Some(&previous),
        )
        .unwrap();
        assert_eq!(token.access_token, "new");
        assert_eq!(token.refresh_token, "refresh-1");
        assert_eq!(token.region.as_deref(), Some("eu-west-1"));
        assert_eq!(token.profile_arn.as_deref(), Some("arn:aws:codewhisperer:p/1"));
        let remaining = token.expires_at - OffsetDateTime::now_utc();
        assert!(remaining > time::Duration::minutes(25));
    }

    #[test]
    fn invalid_expires_in_defaults_to_one_hour() {
        let token = token_from_response(&json!({"accessToken": "t", "expiresIn": -5}), None).unwrap();
        let remaining = token.expires_at - OffsetDateTime::now_utc();
        assert!(remaining > time::Duration::minutes(55));
    }

    #[tokio::test]
    async fn callback_server_round_trip() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(serve_callback(listener, "st1".to_string(), tx));

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream
            .write_all(b"GET /oauth/callback?code=abc&state=st1 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let result = rx.recv().await.unwrap().unwrap();
        assert_eq!(result.code, "abc");
        assert_eq!(result.state, "st1");
    }
}
