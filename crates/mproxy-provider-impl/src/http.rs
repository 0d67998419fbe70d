//! Shared wreq client for provider-internal IO (OAuth flows, refresh).

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use mproxy_provider_core::{ProviderError, ProviderResult};

static CLIENT_CACHE: OnceLock<Mutex<HashMap<Option<String>, wreq::Client>>> = OnceLock::new();

pub fn client_for_proxy(proxy: Option<&str>) -> ProviderResult<wreq::Client> {
    let key = proxy
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());

    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache
        .lock()
        .map_err(|_| ProviderError::Other("http client cache lock failed".to_string()))?;
    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }

    let mut builder = wreq::Client::builder().timeout(Duration::from_secs(30));
    if let Some(proxy_url) = key.as_deref() {
        builder = builder
            .proxy(wreq::Proxy::all(proxy_url).map_err(|err| ProviderError::Other(err.to_string()))?);
    }
    let client = builder
        .build()
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    guard.insert(key, client.clone());
    Ok(client)
}

pub struct JsonResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl JsonResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> ProviderResult<serde_json::Value> {
        serde_json::from_slice(&self.body)
            .map_err(|err| ProviderError::Other(format!("invalid json response: {err}")))
    }
}

pub async fn post_json(
    proxy: Option<&str>,
    url: &str,
    headers: &[(&str, String)],
    body: &serde_json::Value,
) -> ProviderResult<JsonResponse> {
    let client = client_for_proxy(proxy)?;
    let mut builder = client.post(url).header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, value);
    }
    let payload =
        serde_json::to_vec(body).map_err(|err| ProviderError::Other(err.to_string()))?;
    let resp = builder
        .body(payload)
        .send()
        .await
        .map_err(|err| ProviderError::Other(format!("request failed: {err}")))?;
    let status = resp.status().as_u16();
    let bytes = resp
        .bytes()
        .await
        .map_err(|err| ProviderError::Other(format!("read failed: {err}")))?;
    Ok(JsonResponse {
        status,
        body: bytes.to_vec(),
    })
}
