//! The per-request conductor: resolve -> select -> admit -> translate ->
//! execute -> retry or surface.

mod stream;
mod thinking;

pub use thinking::apply_thinking;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

use mproxy_provider_core::{
    Candidate, ClientId, QuotaSignal, SharedClient, UpstreamBody, UpstreamFailure,
    UpstreamProvider,
};
use mproxy_transform::{transform_request, transform_response, GenerateResponse, Proto};

use crate::classify::RouteRequest;
use crate::error::GatewayError;
use crate::state::AppState;
use crate::upstream::UpstreamClient;

/// What the conductor bound the request to; handed to the logging layer.
#[derive(Debug, Clone)]
pub struct RouteBinding {
    pub provider: String,
    pub client_label: String,
    pub model: String,
}

pub enum GenerateOutcome {
    Json {
        binding: RouteBinding,
        body: Value,
    },
    Stream {
        binding: RouteBinding,
        content_type: &'static str,
        body: tokio::sync::mpsc::Receiver<Bytes>,
    },
}

enum FailureAction {
    /// Try another client (the failed one was demoted or cooled).
    RetryOther,
    /// Retry the same client (a forced token refresh just succeeded).
    RetrySame,
    /// Sleep, then retry (transient upstream trouble).
    Backoff(Duration),
    Surface(GatewayError),
}

pub struct Engine {
    state: Arc<AppState>,
    client: Arc<dyn UpstreamClient>,
}

impl Engine {
    pub fn new(state: Arc<AppState>, client: Arc<dyn UpstreamClient>) -> Self {
        Self { state, client }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub async fn handle_generate(
        &self,
        route: RouteRequest,
    ) -> Result<GenerateOutcome, GatewayError> {
        if route.requested_model.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("model is required".to_string()));
        }

        let resolved = self
            .state
            .resolver
            .resolve(&route.requested_model)
            .map_err(|_| GatewayError::ModelNotFound(route.requested_model.clone()))?;

        let mut base = resolved.base.clone();
        if self.state.registry.get(&base).is_none() {
            return Err(GatewayError::ModelNotFound(base));
        }

        let routing = self.state.global.load().routing.clone();
        let max_transient_retries = routing.request_retry.max(1);
        let max_retry_interval = routing.max_retry_interval_duration();

        let mut tried: HashSet<ClientId> = HashSet::new();
        let mut refreshed: HashSet<ClientId> = HashSet::new();
        let mut transient_attempts: u32 = 0;
        let mut credential_failures: u32 = 0;
        let mut preview_tried = false;
        // Hard bound on the whole attempt loop, whatever combination of
        // demotions and retries happens.
        let mut total_attempts: u32 = 0;

        loop {
            total_attempts += 1;
            if total_attempts > max_transient_retries + 16 {
                return Err(GatewayError::UpstreamTransient(
                    "retry budget exhausted".to_string(),
                ));
            }

            let candidates = self.candidates_for(&base, &tried);
            let Some(client_id) =
                self.state
                    .selector
                    .select(&base, &candidates, &self.state.cooldown)
            else {
                // All candidates cooled, suspended, or already tried.
                if routing.quota_exceeded.switch_preview_model
                    && !preview_tried
                    && let Some(sibling) = self.preview_sibling(&base)
                {
                    tracing::info!(from = %base, to = %sibling, "switching to preview sibling");
                    base = sibling;
                    preview_tried = true;
                    tried.clear();
                    continue;
                }
                if credential_failures > 0 && credential_failures as usize >= tried.len() {
                    return Err(GatewayError::Upstream {
                        status: 401,
                        body: br#"{"error":{"message":"credential expired and refresh failed","type":"authentication_error"}}"#.to_vec(),
                    });
                }
                let retry_after = self
                    .state
                    .cooldown
                    .nearest_recovery(&base, &self.state.registry.candidates(&base))
                    .map(|until| {
                        let remaining = until - time::OffsetDateTime::now_utc();
                        Duration::try_from(remaining).unwrap_or(Duration::from_secs(1))
                    });
                return Err(GatewayError::NoCapacity { retry_after });
            };

            let Some(client) = self.state.pool.get(&client_id) else {
                tried.insert(client_id);
                continue;
            };
            let Some(provider) = self.state.provider(&client.provider_tag) else {
                tried.insert(client_id);
                continue;
            };

            // Property: an expired token never reaches the wire. One forced
            // refresh is allowed; a second expiry demotes the client.
            if let Err(action) = self
                .ensure_live_token(&client, provider.as_ref(), &base, &mut refreshed)
                .await
            {
                match action {
                    FailureAction::RetryOther => {
                        credential_failures += 1;
                        tried.insert(client_id);
                        continue;
                    }
                    FailureAction::Surface(err) => return Err(err),
                    _ => continue,
                }
            }

            let in_flight = self.state.selector.begin(&client_id);

            // Admission gate. Cancel-safe: dropping this future releases it.
            self.state.limiter.wait(&client.token_key()).await;

            let (upstream_model, body) =
                self.prepare_upstream(&route, &resolved.suffix, &base, &client, provider.as_ref())?;

            let upstream_req = provider
                .build_generate(&client, &upstream_model, body, route.streaming)
                .await
                .map_err(|err| GatewayError::Internal(err.to_string()))?;

            let binding = RouteBinding {
                provider: client.provider_tag.clone(),
                client_label: client.label.clone(),
                model: base.clone(),
            };

            let failure = if route.streaming {
                match self
                    .try_stream(
                        &route,
                        &binding,
                        &client,
                        provider.as_ref(),
                        upstream_req,
                        &upstream_model,
                        in_flight,
                    )
                    .await
                {
                    Ok(outcome) => return Ok(outcome),
                    Err(failure) => failure,
                }
            } else {
                let _in_flight = in_flight;
                match self.try_non_stream(&route, &binding, &client, upstream_req).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(failure) => failure,
                }
            };

            match self
                .classify_and_note(
                    &client,
                    provider.as_ref(),
                    &base,
                    &failure,
                    &mut refreshed,
                    routing.quota_exceeded.switch_project,
                    transient_attempts,
                    max_transient_retries,
                    max_retry_interval,
                )
                .await
            {
                FailureAction::RetryOther => {
                    tried.insert(client_id);
                }
                FailureAction::RetrySame => {}
                FailureAction::Backoff(delay) => {
                    transient_attempts += 1;
                    tokio::time::sleep(delay).await;
                }
                FailureAction::Surface(err) => return Err(err),
            }
        }
    }

    fn candidates_for(&self, model: &str, tried: &HashSet<ClientId>) -> Vec<Candidate> {
        self.state
            .resolver
            .selectable_candidates(model)
            .into_iter()
            .filter(|id| !tried.contains(id))
            .filter_map(|id| {
                let client = self.state.pool.get(&id)?;
                Some(Candidate {
                    client_id: id,
                    priority: client.priority,
                })
            })
            .collect()
    }

    /// Preview sibling of a model: the first registered id extending the
    /// base with a `-preview` segment.
    fn preview_sibling(&self, base: &str) -> Option<String> {
        let needle = format!("{base}-preview");
        self.state
            .registry
            .model_ids()
            .into_iter()
            .find(|id| id == &needle || id.starts_with(&needle))
    }

    /// Expired-token gate: refresh once before use, demote on repeat.
    async fn ensure_live_token(
        &self,
        client: &SharedClient,
        provider: &dyn UpstreamProvider,
        model: &str,
        refreshed: &mut HashSet<ClientId>,
    ) -> Result<(), FailureAction> {
        let Some(snapshot) = client.token_snapshot().await else {
            return Ok(());
        };
        if snapshot.expires_at > time::OffsetDateTime::now_utc() {
            return Ok(());
        }
        if refreshed.insert(client.client_id.clone()) {
            match provider.refresh(client).await {
                Ok(token) => {
                    client.replace_token(token).await;
                    self.persist_token(client).await;
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(client = %client.client_id, %err, "forced refresh failed");
                }
            }
        }
        self.state
            .cooldown
            .suspend(&client.client_id, model, "credential");
        Err(FailureAction::RetryOther)
    }

    fn prepare_upstream(
        &self,
        route: &RouteRequest,
        suffix: &mproxy_provider_core::ThinkingSuffix,
        base: &str,
        client: &SharedClient,
        provider: &dyn UpstreamProvider,
    ) -> Result<(String, Bytes), GatewayError> {
        // Advertised name -> client-local name -> upstream name.
        let local = match &client.prefix {
            Some(prefix) => base.strip_prefix(prefix.as_str()).unwrap_or(base),
            None => base,
        };
        let upstream_model = self
            .state
            .resolver
            .rewrite_for_upstream(local, &client.provider_tag);

        let mut translated = transform_request(provider.proto(), route.request.clone())
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        translated.set_model(&upstream_model);

        let mut payload = translated
            .body_value()
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        apply_thinking(provider.proto(), &mut payload, suffix);
        self.state.apply_rules(&upstream_model, &mut payload);

        let bytes = serde_json::to_vec(&payload)
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        Ok((upstream_model, Bytes::from(bytes)))
    }

    async fn try_non_stream(
        &self,
        route: &RouteRequest,
        binding: &RouteBinding,
        client: &SharedClient,
        upstream_req: mproxy_provider_core::UpstreamHttpRequest,
    ) -> Result<GenerateOutcome, UpstreamFailure> {
        let resp = self.client.send(upstream_req).await?;
        if !(200..300).contains(&resp.status) {
            return Err(failure_from_response(resp).await);
        }
        let UpstreamBody::Bytes(body) = resp.body else {
            return Err(UpstreamFailure::Transport {
                kind: mproxy_provider_core::UpstreamTransportErrorKind::Other,
                message: "unexpected streaming body".to_string(),
            });
        };

        self.state.limiter.mark_success(&client.token_key());

        let provider_proto = self
            .state
            .provider(&client.provider_tag)
            .map(|p| p.proto())
            .unwrap_or(route.caller);
        let native = decode_response(provider_proto, &body).map_err(|err| {
            UpstreamFailure::Transport {
                kind: mproxy_provider_core::UpstreamTransportErrorKind::Other,
                message: format!("undecodable upstream response: {err}"),
            }
        })?;

        let (input_tokens, output_tokens) = usage_of(&native);
        self.state.usage.record_success(
            &binding.provider,
            &client.client_id,
            &binding.model,
            input_tokens,
            output_tokens,
        );

        let translated = transform_response(route.caller, &binding.model, native)
            .map_err(|err| UpstreamFailure::Transport {
                kind: mproxy_provider_core::UpstreamTransportErrorKind::Other,
                message: format!("response translation failed: {err}"),
            })?;
        let body = encode_response(&translated).map_err(|err| UpstreamFailure::Transport {
            kind: mproxy_provider_core::UpstreamTransportErrorKind::Other,
            message: format!("response encoding failed: {err}"),
        })?;

        tracing::info!(
            provider = %binding.provider,
            client = %binding.client_label,
            model = %binding.model,
            "request completed"
        );
        Ok(GenerateOutcome::Json {
            binding: binding.clone(),
            body,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_stream(
        &self,
        route: &RouteRequest,
        binding: &RouteBinding,
        client: &SharedClient,
        provider: &dyn UpstreamProvider,
        upstream_req: mproxy_provider_core::UpstreamHttpRequest,
        upstream_model: &str,
        in_flight: mproxy_provider_core::InFlightGuard,
    ) -> Result<GenerateOutcome, UpstreamFailure> {
        let resp = self.client.send(upstream_req).await?;
        if !(200..300).contains(&resp.status) {
            return Err(failure_from_response(resp).await);
        }
        let rx = match resp.body {
            UpstreamBody::Stream(rx) => rx,
            UpstreamBody::Bytes(bytes) => {
                // Some upstreams answer small streams in one buffered body.
                let (tx, rx) = tokio::sync::mpsc::channel(1);
                let _ = tx.try_send(bytes);
                rx
            }
        };

        self.state.limiter.mark_success(&client.token_key());

        stream::bootstrap_stream(
            self.state.clone(),
            route.caller,
            provider.proto(),
            binding.clone(),
            client.clone(),
            upstream_model.to_string(),
            rx,
            in_flight,
        )
        .await
    }

    /// Shared failure classification for stream bootstrap and non-stream
    /// paths. Mutates cooldown/limiter state and decides the next move.
    #[allow(clippy::too_many_arguments)]
    async fn classify_and_note(
        &self,
        client: &SharedClient,
        provider: &dyn UpstreamProvider,
        model: &str,
        failure: &UpstreamFailure,
        refreshed: &mut HashSet<ClientId>,
        switch_project: bool,
        transient_attempts: u32,
        max_transient_retries: u32,
        max_retry_interval: Duration,
    ) -> FailureAction {
        let key = client.token_key();
        let message = failure.message();

        let decision = provider.classify_failure(failure);

        // Quota signals are quota, even though their bodies often carry
        // suspension-sounding wording; keyword detection runs on the rest.
        if decision.signal != QuotaSignal::Quota
            && self.state.limiter.detect_suspended(&key, &message)
        {
            tracing::warn!(client = %client.client_id, "account suspension detected");
            self.state
                .cooldown
                .suspend(&client.client_id, model, "suspended");
            self.state
                .usage
                .record_failure(&client.provider_tag, &client.client_id, model);
            return FailureAction::RetryOther;
        }

        match decision.signal {
            QuotaSignal::Quota => {
                self.state.cooldown.mark_quota(&client.client_id, model);
                self.state
                    .usage
                    .record_failure(&client.provider_tag, &client.client_id, model);
                if switch_project {
                    FailureAction::RetryOther
                } else {
                    FailureAction::Surface(surface_failure(failure))
                }
            }
            QuotaSignal::CredentialExpired => {
                if refreshed.insert(client.client_id.clone()) {
                    match provider.refresh(client).await {
                        Ok(token) => {
                            client.replace_token(token).await;
                            self.persist_token(client).await;
                            return FailureAction::RetrySame;
                        }
                        Err(err) => {
                            tracing::warn!(client = %client.client_id, %err, "forced refresh failed");
                        }
                    }
                }
                self.state
                    .cooldown
                    .suspend(&client.client_id, model, "credential");
                FailureAction::RetryOther
            }
            QuotaSignal::Suspended => {
                self.state
                    .cooldown
                    .suspend(&client.client_id, model, "suspended");
                FailureAction::RetryOther
            }
            QuotaSignal::Transient => {
                self.state.limiter.mark_failed(&key);
                self.state
                    .usage
                    .record_failure(&client.provider_tag, &client.client_id, model);
                if transient_attempts + 1 < max_transient_retries {
                    let delay = Duration::from_secs(1 << transient_attempts.min(5));
                    FailureAction::Backoff(delay.min(max_retry_interval))
                } else {
                    FailureAction::Surface(GatewayError::UpstreamTransient(message))
                }
            }
            QuotaSignal::Fatal => FailureAction::Surface(surface_failure(failure)),
        }
    }

    /// Write a refreshed token back to its credential file without touching
    /// fields this process does not own.
    async fn persist_token(&self, client: &SharedClient) {
        if client.runtime_only {
            return;
        }
        let Some(store) = &self.state.store else {
            return;
        };
        let record = {
            let records = self.state.records.lock().unwrap_or_else(|e| e.into_inner());
            records.get(&client.client_id).cloned()
        };
        let Some(mut record) = record else {
            return;
        };
        record.token = client.token().await;
        if let Err(err) = store.save(&record).await {
            tracing::warn!(client = %client.client_id, %err, "failed to persist refreshed token");
        } else {
            let mut records = self.state.records.lock().unwrap_or_else(|e| e.into_inner());
            records.insert(record.id.clone(), record);
        }
    }
}

fn surface_failure(failure: &UpstreamFailure) -> GatewayError {
    match failure {
        UpstreamFailure::Http { status, body, .. } => GatewayError::Upstream {
            status: *status,
            body: body.to_vec(),
        },
        UpstreamFailure::Transport { message, .. } => {
            GatewayError::UpstreamTransient(message.clone())
        }
    }
}

async fn failure_from_response(
    resp: mproxy_provider_core::UpstreamHttpResponse,
) -> UpstreamFailure {
    let status = resp.status;
    let headers = resp.headers;
    let body = match resp.body {
        UpstreamBody::Bytes(bytes) => bytes,
        UpstreamBody::Stream(mut rx) => {
            let mut collected = Vec::new();
            while let Some(chunk) = rx.recv().await {
                collected.extend_from_slice(&chunk);
                if collected.len() > 64 * 1024 {
                    break;
                }
            }
            Bytes::from(collected)
        }
    };
    UpstreamFailure::Http {
        status,
        headers,
        body,
    }
}

fn decode_response(proto: Proto, body: &[u8]) -> Result<GenerateResponse, serde_json::Error> {
    Ok(match proto {
        Proto::OpenAI => GenerateResponse::OpenAI(serde_json::from_slice(body)?),
        Proto::Claude => GenerateResponse::Claude(serde_json::from_slice(body)?),
        Proto::Gemini => GenerateResponse::Gemini(serde_json::from_slice(body)?),
    })
}

fn encode_response(resp: &GenerateResponse) -> Result<Value, serde_json::Error> {
    match resp {
        GenerateResponse::OpenAI(resp) => serde_json::to_value(resp),
        GenerateResponse::Claude(resp) => serde_json::to_value(resp),
        GenerateResponse::Gemini(resp) => serde_json::to_value(resp),
    }
}

fn usage_of(resp: &GenerateResponse) -> (u64, u64) {
    match resp {
        GenerateResponse::OpenAI(resp) => resp
            .usage
            .as_ref()
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0)),
        GenerateResponse::Claude(resp) => (
            resp.usage.input_tokens.unwrap_or(0),
            resp.usage.output_tokens.unwrap_or(0),
        ),
        GenerateResponse::Gemini(resp) => resp
            .usage_metadata
            .as_ref()
            .map(|u| {
                (
                    u.prompt_token_count.unwrap_or(0),
                    u.candidates_token_count.unwrap_or(0) + u.thoughts_token_count.unwrap_or(0),
                )
            })
            .unwrap_or((0, 0)),
    }
}
