//! Protocol surface: every inbound path funnels through the classifier and
//! the engine.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use mproxy_core::{classify_request, Engine, GatewayError, GenerateOutcome, InboundCall};
use mproxy_transform::Proto;

pub fn proxy_router(engine: Arc<Engine>) -> Router {
    Router::new().fallback(handle).with_state(engine)
}

async fn handle(
    State(engine): State<Arc<Engine>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let query = uri.query().map(str::to_string);

    let call = match classify_request(&method, &path, query.as_deref(), &headers, body) {
        Ok(call) => call,
        Err(err) => return error_response(sniff_proto(&path, &headers), err),
    };
    let caller = match &call {
        InboundCall::Generate(route) => route.caller,
        InboundCall::ListModels(proto) => *proto,
    };

    if let Err(denied) = engine
        .state()
        .access
        .authenticate(&headers, query.as_deref())
    {
        return error_response(caller, GatewayError::Unauthorized(denied.message()));
    }

    match call {
        InboundCall::ListModels(proto) => {
            let listing = engine.state().registry.available(proto);
            json_response(StatusCode::OK, &listing)
        }
        InboundCall::Generate(route) => match engine.handle_generate(route).await {
            Ok(GenerateOutcome::Json { binding, body }) => {
                tracing::debug!(
                    provider = %binding.provider,
                    client = %binding.client_label,
                    model = %binding.model,
                    "served non-streaming response"
                );
                json_response(StatusCode::OK, &body)
            }
            Ok(GenerateOutcome::Stream {
                content_type, body, ..
            }) => {
                let stream = ReceiverStream::new(body).map(Ok::<Bytes, Infallible>);
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", content_type)
                    .header("cache-control", "no-store")
                    .body(Body::from_stream(stream))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            Err(err) => error_response(caller, err),
        },
    }
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response {
    (status, axum::Json(body.clone())).into_response()
}

fn error_response(caller: Proto, err: GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, axum::Json(err.body(caller))).into_response();
    if let Some(retry_after) = err.retry_after()
        && let Ok(value) = retry_after.as_secs().max(1).to_string().parse()
    {
        response.headers_mut().insert("retry-after", value);
    }
    response
}

/// Best-effort caller-dialect guess for errors raised before classification.
fn sniff_proto(path: &str, headers: &HeaderMap) -> Proto {
    if path.starts_with("/v1beta") {
        return Proto::Gemini;
    }
    if headers.contains_key("anthropic-version") || path.starts_with("/v1/messages") {
        return Proto::Claude;
    }
    Proto::OpenAI
}
