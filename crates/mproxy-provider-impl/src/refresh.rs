//! Background OAuth refresh with graceful degradation.
//!
//! One loop scans OAuth clients oldest-`last_verified` first and refreshes
//! in bounded-concurrency batches. A failed refresh with an unexpired access
//! token falls back to the existing token; only an expired token surfaces
//! the failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Semaphore;

use mproxy_provider_core::{OAuthToken, ProviderError, SharedClientPool, UpstreamProvider};

#[derive(Debug, Clone)]
pub struct TokenRefresherConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub concurrency: usize,
    /// Delay between dispatches inside one batch.
    pub stagger: Duration,
    /// Refresh opens this long before expiry.
    pub refresh_lead: time::Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for TokenRefresherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 50,
            concurrency: 10,
            stagger: Duration::from_millis(100),
            refresh_lead: time::Duration::minutes(10),
            max_retries: 1,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New token swapped in and the runtime notified.
    Refreshed,
    /// Refresh failed but the existing token is still valid; kept serving.
    Fallback,
    /// Nothing to do (fresh token, non-OAuth client, or no refresh support).
    Skipped,
    /// Refresh failed and the token is expired.
    Failed,
}

type RefreshedCallback = Arc<dyn Fn(&str, &OAuthToken) + Send + Sync>;

pub struct TokenRefresher {
    config: TokenRefresherConfig,
    pool: SharedClientPool,
    providers: HashMap<String, Arc<dyn UpstreamProvider>>,
    on_refreshed: Option<RefreshedCallback>,
}

impl TokenRefresher {
    pub fn new(
        config: TokenRefresherConfig,
        pool: SharedClientPool,
        providers: HashMap<String, Arc<dyn UpstreamProvider>>,
    ) -> Self {
        Self {
            config,
            pool,
            providers,
            on_refreshed: None,
        }
    }

    /// Called after a successful refresh, once the new token is already
    /// visible to in-flight selectors. Used to persist the credential and
    /// warm caches.
    pub fn on_refreshed(mut self, callback: impl Fn(&str, &OAuthToken) + Send + Sync + 'static) -> Self {
        self.on_refreshed = Some(Arc::new(callback));
        self
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.refresh_batch().await;
            }
        });
    }

    /// One scan: oldest-verified OAuth clients first, bounded concurrency,
    /// staggered dispatch.
    pub async fn refresh_batch(&self) {
        let mut clients = self.pool.all();
        clients.retain(|client| {
            matches!(client.kind, mproxy_provider_core::CredentialKind::OAuth)
        });

        let mut ordered = Vec::with_capacity(clients.len());
        for client in clients {
            let last_verified = client.token().await.and_then(|t| t.last_verified);
            ordered.push((last_verified, client));
        }
        ordered.sort_by_key(|(last_verified, _)| *last_verified);
        ordered.truncate(self.config.batch_size);

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut handles = Vec::new();
        for (i, (_, client)) in ordered.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.stagger).await;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let this = self.clone_for_task();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                this.refresh_single(&client).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn clone_for_task(&self) -> RefresherTask {
        RefresherTask {
            config: self.config.clone(),
            providers: self.providers.clone(),
            on_refreshed: self.on_refreshed.clone(),
        }
    }

    pub async fn refresh_client(&self, client_id: &str) -> RefreshOutcome {
        match self.pool.get(client_id) {
            Some(client) => self.clone_for_task().refresh_single(&client).await,
            None => RefreshOutcome::Skipped,
        }
    }
}

struct RefresherTask {
    config: TokenRefresherConfig,
    providers: HashMap<String, Arc<dyn UpstreamProvider>>,
    on_refreshed: Option<RefreshedCallback>,
}

impl RefresherTask {
    async fn refresh_single(
        &self,
        client: &mproxy_provider_core::SharedClient,
    ) -> RefreshOutcome {
        let Some(provider) = self.providers.get(&client.provider_tag) else {
            return RefreshOutcome::Skipped;
        };
        let Some(token) = client.token().await else {
            return RefreshOutcome::Skipped;
        };

        let now = OffsetDateTime::now_utc();
        let deadline = token.expires_at - self.config.refresh_lead;
        let recently_verified = token
            .last_verified
            .is_some_and(|at| now - at < self.config.refresh_lead);
        if now < deadline && recently_verified {
            return RefreshOutcome::Skipped;
        }

        match self.refresh_with_retry(provider.as_ref(), client).await {
            Ok(new_token) => {
                client.replace_token(new_token.clone()).await;
                if let Some(callback) = &self.on_refreshed {
                    callback(&client.client_id, &new_token);
                }
                tracing::debug!(client = %client.client_id, "token refreshed");
                RefreshOutcome::Refreshed
            }
            Err(ProviderError::Unsupported(_)) => RefreshOutcome::Skipped,
            Err(err) => {
                if now < token.expires_at {
                    // Keep serving with the unexpired token; bump
                    // last_verified so the next scan does not thrash.
                    let remaining = token.expires_at - now;
                    tracing::warn!(
                        client = %client.client_id,
                        %err,
                        remaining_secs = remaining.whole_seconds(),
                        "token refresh failed, keeping existing token"
                    );
                    client.touch_last_verified(now).await;
                    RefreshOutcome::Fallback
                } else {
                    tracing::error!(
                        client = %client.client_id,
                        %err,
                        "token refresh failed and token is expired"
                    );
                    RefreshOutcome::Failed
                }
            }
        }
    }

    async fn refresh_with_retry(
        &self,
        provider: &dyn UpstreamProvider,
        client: &mproxy_provider_core::ClientHandle,
    ) -> Result<OAuthToken, ProviderError> {
        let attempts = self.config.max_retries + 1;
        let mut last_err = ProviderError::Other("no refresh attempts made".to_string());
        for attempt in 1..=attempts {
            match provider.refresh(client).await {
                Ok(token) => {
                    if attempt > 1 {
                        tracing::info!(
                            client = %client.client_id,
                            attempt,
                            "token refresh succeeded after retry"
                        );
                    }
                    return Ok(token);
                }
                Err(err @ ProviderError::Unsupported(_)) => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        client = %client.client_id,
                        attempt,
                        attempts,
                        %err,
                        "token refresh attempt failed"
                    );
                    last_err = err;
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use mproxy_provider_core::{
        ClientHandle, ClientPool, CredentialKind, ModelInfo, ProviderResult, Proto,
        UpstreamHttpRequest,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeProvider {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl UpstreamProvider for FakeProvider {
        fn name(&self) -> &'static str {
            "kiro"
        }

        fn proto(&self) -> Proto {
            Proto::Claude
        }

        fn models(&self, _client: &ClientHandle) -> Vec<ModelInfo> {
            Vec::new()
        }

        async fn build_generate(
            &self,
            _client: &ClientHandle,
            _model: &str,
            _body: Bytes,
            _stream: bool,
        ) -> ProviderResult<UpstreamHttpRequest> {
            Err(ProviderError::Unsupported("test"))
        }

        async fn refresh(&self, _client: &ClientHandle) -> ProviderResult<OAuthToken> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Other("refresh endpoint down".to_string()));
            }
            Ok(token(time::Duration::hours(2), Some(OffsetDateTime::now_utc())))
        }
    }

    fn token(valid_for: time::Duration, last_verified: Option<OffsetDateTime>) -> OAuthToken {
        OAuthToken {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            expires_at: OffsetDateTime::now_utc() + valid_for,
            client_id: None,
            client_secret: None,
            start_url: None,
            region: None,
            profile_arn: None,
            auth_method: Some("social".to_string()),
            last_verified,
        }
    }

    fn client_with(token_value: OAuthToken) -> Arc<ClientHandle> {
        Arc::new(ClientHandle::new(
            "k1".to_string(),
            "kiro",
            Proto::Claude,
            CredentialKind::OAuth,
            "user@example.com",
            0,
            Some(token_value),
        ))
    }

    fn refresher(fail: bool, pool: SharedClientPool) -> (Arc<FakeProvider>, TokenRefresher) {
        let provider = Arc::new(FakeProvider {
            calls: AtomicU32::new(0),
            fail,
        });
        let mut providers: HashMap<String, Arc<dyn UpstreamProvider>> = HashMap::new();
        providers.insert("kiro".to_string(), provider.clone());
        let config = TokenRefresherConfig {
            retry_delay: Duration::from_millis(1),
            stagger: Duration::from_millis(1),
            ..Default::default()
        };
        (provider, TokenRefresher::new(config, pool, providers))
    }

    #[tokio::test]
    async fn fresh_recently_verified_tokens_are_skipped() {
        let pool = Arc::new(ClientPool::new());
        pool.insert(client_with(token(
            time::Duration::hours(2),
            Some(OffsetDateTime::now_utc()),
        )));
        let (provider, refresher) = refresher(false, pool);
        assert_eq!(refresher.refresh_client("k1").await, RefreshOutcome::Skipped);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_and_callback_fires() {
        let pool = Arc::new(ClientPool::new());
        pool.insert(client_with(token(time::Duration::minutes(5), None)));
        let (provider, refresher) = refresher(false, pool.clone());
        let notified = Arc::new(AtomicU32::new(0));
        let notified2 = notified.clone();
        let refresher = refresher.on_refreshed(move |_, _| {
            notified2.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(
            refresher.refresh_client("k1").await,
            RefreshOutcome::Refreshed
        );
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // The swapped-in token is immediately visible.
        let client = pool.get("k1").unwrap();
        let snapshot = client.token_snapshot().await.unwrap();
        assert!(snapshot.expires_at > OffsetDateTime::now_utc() + time::Duration::hours(1));
    }

    #[tokio::test]
    async fn failed_refresh_with_valid_token_degrades_gracefully() {
        let pool = Arc::new(ClientPool::new());
        pool.insert(client_with(token(time::Duration::minutes(30), None)));
        let (provider, refresher) = refresher(true, pool.clone());

        assert_eq!(
            refresher.refresh_client("k1").await,
            RefreshOutcome::Fallback
        );
        // One retry by default.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        // Old token kept; last_verified bumped to prevent thrash.
        let client = pool.get("k1").unwrap();
        let current = client.token().await.unwrap();
        assert_eq!(current.access_token, "at");
        assert!(current.last_verified.is_some());
    }

    #[tokio::test]
    async fn failed_refresh_with_expired_token_surfaces_failure() {
        let pool = Arc::new(ClientPool::new());
        pool.insert(client_with(token(time::Duration::minutes(-1), None)));
        let (_, refresher) = refresher(true, pool);
        assert_eq!(refresher.refresh_client("k1").await, RefreshOutcome::Failed);
    }
}
