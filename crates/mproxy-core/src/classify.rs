//! Inbound request classification into the three protocol surfaces.

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;

use mproxy_protocol::{claude, gemini, openai};
use mproxy_transform::{GenerateRequest, Proto};

use crate::error::GatewayError;

/// Per-request routing value, immutable after parse.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub caller: Proto,
    pub requested_model: String,
    pub streaming: bool,
    pub request: GenerateRequest,
}

#[derive(Debug)]
pub enum InboundCall {
    Generate(RouteRequest),
    ListModels(Proto),
}

pub fn classify_request(
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<InboundCall, GatewayError> {
    let path = path.trim_start_matches('/');
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        ["v1", "chat", "completions"] => {
            ensure_method(method, Method::POST, "chat completions")?;
            let body: openai::ChatCompletionRequest = parse_json(&body, "chat completions")?;
            Ok(InboundCall::Generate(openai_route(body)))
        }
        ["v1", "completions"] => {
            ensure_method(method, Method::POST, "completions")?;
            let legacy: openai::CompletionRequest = parse_json(&body, "completions")?;
            Ok(InboundCall::Generate(openai_route(chat_from_legacy(legacy))))
        }
        ["v1", "messages"] => {
            ensure_method(method, Method::POST, "messages")?;
            let body: claude::MessagesRequest = parse_json(&body, "messages")?;
            let streaming = body.stream.unwrap_or(false);
            let requested_model = body.model.clone();
            if requested_model.is_empty() {
                return Err(GatewayError::InvalidRequest("model is required".to_string()));
            }
            Ok(InboundCall::Generate(RouteRequest {
                caller: Proto::Claude,
                requested_model,
                streaming,
                request: GenerateRequest::Claude(body),
            }))
        }
        ["v1", "models"] => {
            ensure_method(method, Method::GET, "models list")?;
            Ok(InboundCall::ListModels(detect_models_protocol(
                headers, query,
            )))
        }
        ["v1beta", "models"] | ["v1beta", "openai", "models"] => {
            ensure_method(method, Method::GET, "models list")?;
            Ok(InboundCall::ListModels(Proto::Gemini))
        }
        ["v1beta", "models", rest @ ..] => {
            let joined = rest.join("/");
            let (model, action) = match joined.split_once(':') {
                Some((model, action)) => (model.to_string(), action.to_string()),
                None => {
                    return Err(GatewayError::InvalidRequest(
                        "expected models/{model}:{action}".to_string(),
                    ));
                }
            };
            ensure_method(method, Method::POST, "generate content")?;
            let streaming = match action.as_str() {
                "generateContent" => false,
                "streamGenerateContent" => true,
                other => {
                    return Err(GatewayError::InvalidRequest(format!(
                        "unsupported action: {other}"
                    )));
                }
            };
            if model.is_empty() {
                return Err(GatewayError::InvalidRequest("model is required".to_string()));
            }
            let body: gemini::GenerateContentRequest = parse_json(&body, "generate content")?;
            Ok(InboundCall::Generate(RouteRequest {
                caller: Proto::Gemini,
                requested_model: model.clone(),
                streaming,
                request: GenerateRequest::Gemini { model, body },
            }))
        }
        _ => Err(GatewayError::ModelNotFound(format!("unknown path: /{path}"))),
    }
}

fn openai_route(body: openai::ChatCompletionRequest) -> RouteRequest {
    let streaming = body.stream.unwrap_or(false);
    let requested_model = body.model.clone();
    RouteRequest {
        caller: Proto::OpenAI,
        requested_model,
        streaming,
        request: GenerateRequest::OpenAI(body),
    }
}

/// Legacy completions ride the chat pipeline: the prompt becomes one user
/// message.
fn chat_from_legacy(legacy: openai::CompletionRequest) -> openai::ChatCompletionRequest {
    openai::ChatCompletionRequest {
        model: legacy.model.clone(),
        messages: vec![openai::ChatMessage::text(
            openai::ChatRole::User,
            legacy.prompt_text(),
        )],
        temperature: legacy.temperature,
        top_p: None,
        max_tokens: legacy.max_tokens,
        max_completion_tokens: None,
        stop: None,
        stream: legacy.stream,
        stream_options: None,
        tools: None,
        tool_choice: None,
        reasoning_effort: None,
        extra: Default::default(),
    }
}

/// `GET /v1/models` is shared by all three dialects; sniff the caller from
/// its auth headers.
fn detect_models_protocol(headers: &HeaderMap, query: Option<&str>) -> Proto {
    if headers.contains_key("anthropic-version") {
        return Proto::Claude;
    }
    if headers.contains_key("x-goog-api-key")
        || query.is_some_and(|q| q.split('&').any(|p| p.starts_with("key=")))
    {
        return Proto::Gemini;
    }
    Proto::OpenAI
}

fn parse_json<T: DeserializeOwned>(body: &[u8], label: &str) -> Result<T, GatewayError> {
    if body.is_empty() {
        return Err(GatewayError::InvalidRequest(format!(
            "missing body for {label}"
        )));
    }
    serde_json::from_slice(body)
        .map_err(|err| GatewayError::InvalidRequest(format!("invalid json: {err}")))
}

fn ensure_method(method: &Method, expected: Method, label: &str) -> Result<(), GatewayError> {
    if *method == expected {
        Ok(())
    } else {
        Err(GatewayError::InvalidRequest(format!(
            "invalid method for {label}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify(method: Method, path: &str, body: serde_json::Value) -> InboundCall {
        classify_request(
            &method,
            path,
            None,
            &HeaderMap::new(),
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn openai_chat_detects_stream_flag() {
        let call = classify(
            Method::POST,
            "/v1/chat/completions",
            json!({"model": "gpt-5", "messages": [], "stream": true}),
        );
        match call {
            InboundCall::Generate(route) => {
                assert_eq!(route.caller, Proto::OpenAI);
                assert_eq!(route.requested_model, "gpt-5");
                assert!(route.streaming);
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[test]
    fn legacy_completions_become_chat() {
        let call = classify(
            Method::POST,
            "/v1/completions",
            json!({"model": "gpt-5", "prompt": "say hi"}),
        );
        match call {
            InboundCall::Generate(route) => match route.request {
                GenerateRequest::OpenAI(req) => {
                    assert_eq!(req.messages.len(), 1);
                    assert_eq!(req.messages[0].content_text(), "say hi");
                }
                other => panic!("unexpected request: {other:?}"),
            },
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[test]
    fn gemini_path_carries_model_and_action() {
        let call = classify(
            Method::POST,
            "/v1beta/models/gemini-2.5-pro(8192):streamGenerateContent",
            json!({"contents": []}),
        );
        match call {
            InboundCall::Generate(route) => {
                assert_eq!(route.caller, Proto::Gemini);
                assert_eq!(route.requested_model, "gemini-2.5-pro(8192)");
                assert!(route.streaming);
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[test]
    fn models_list_protocol_sniffing() {
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-version", "2023-06-01".parse().unwrap());
        let call = classify_request(&Method::GET, "/v1/models", None, &headers, Bytes::new())
            .unwrap();
        assert!(matches!(call, InboundCall::ListModels(Proto::Claude)));

        let call = classify_request(
            &Method::GET,
            "/v1/models",
            Some("key=abc"),
            &HeaderMap::new(),
            Bytes::new(),
        )
        .unwrap();
        assert!(matches!(call, InboundCall::ListModels(Proto::Gemini)));
    }

    #[test]
    fn missing_model_is_invalid_request() {
        let err = classify_request(
            &Method::POST,
            "/v1/messages",
            None,
            &HeaderMap::new(),
            Bytes::from_static(b"{\"model\":\"\",\"max_tokens\":10,\"messages\":[]}"),
        )
        .unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
