use serde::{Deserialize, Serialize};
use serde_json;

use mproxy_protocol::{claude, gemini, openai};

use crate::generate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    OpenAI,
    Claude,
    Gemini,
}

impl Proto {
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::OpenAI => "openai",
            Proto::Claude => "claude",
            Proto::Gemini => "gemini",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransformError {
    ProtoMismatch,
    UnsupportedPair { src: Proto, dst: Proto },
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::ProtoMismatch => write!(f, "payload does not match source protocol"),
            TransformError::UnsupportedPair { src, dst } => {
                write!(f, "unsupported translation {} -> {}", src.as_str(), dst.as_str())
            }
        }
    }
}

impl std::error::Error for TransformError {}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone)]
pub enum GenerateRequest {
    OpenAI(openai::ChatCompletionRequest),
    Claude(claude::MessagesRequest),
    Gemini {
        model: String,
        body: gemini::GenerateContentRequest,
    },
}

impl GenerateRequest {
    pub fn proto(&self) -> Proto {
        match self {
            GenerateRequest::OpenAI(_) => Proto::OpenAI,
            GenerateRequest::Claude(_) => Proto::Claude,
            GenerateRequest::Gemini { .. } => Proto::Gemini,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            GenerateRequest::OpenAI(req) => &req.model,
            GenerateRequest::Claude(req) => &req.model,
            GenerateRequest::Gemini { model, .. } => model,
        }
    }

    pub fn set_model(&mut self, new_model: &str) {
        match self {
            GenerateRequest::OpenAI(req) => req.model = new_model.to_string(),
            GenerateRequest::Claude(req) => req.model = new_model.to_string(),
            GenerateRequest::Gemini { model, .. } => *model = new_model.to_string(),
        }
    }

    pub fn body_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            GenerateRequest::OpenAI(req) => serde_json::to_value(req),
            GenerateRequest::Claude(req) => serde_json::to_value(req),
            GenerateRequest::Gemini { body, .. } => serde_json::to_value(body),
        }
    }
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone)]
pub enum GenerateResponse {
    OpenAI(openai::ChatCompletionResponse),
    Claude(claude::MessagesResponse),
    Gemini(gemini::GenerateContentResponse),
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone)]
pub enum StreamEvent {
    OpenAI(openai::ChatCompletionChunk),
    Claude(claude::StreamEvent),
    Gemini(gemini::GenerateContentResponse),
}

/// Translate a caller request into the provider dialect.
pub fn transform_request(
    dst: Proto,
    req: GenerateRequest,
) -> Result<GenerateRequest, TransformError> {
    match (req, dst) {
        (req, dst) if req.proto() == dst => Ok(req),
        (GenerateRequest::OpenAI(req), Proto::Claude) => Ok(GenerateRequest::Claude(
            generate::openai2claude::request(req),
        )),
        (GenerateRequest::OpenAI(req), Proto::Gemini) => {
            let (model, body) = generate::openai2gemini::request(req);
            Ok(GenerateRequest::Gemini { model, body })
        }
        (GenerateRequest::Claude(req), Proto::OpenAI) => Ok(GenerateRequest::OpenAI(
            generate::claude2openai::request(req),
        )),
        (GenerateRequest::Claude(req), Proto::Gemini) => {
            let (model, body) = generate::claude2gemini::request(req);
            Ok(GenerateRequest::Gemini { model, body })
        }
        (GenerateRequest::Gemini { model, body }, Proto::OpenAI) => Ok(GenerateRequest::OpenAI(
            generate::gemini2openai::request(&model, body),
        )),
        (GenerateRequest::Gemini { model, body }, Proto::Claude) => Ok(GenerateRequest::Claude(
            generate::gemini2claude::request(&model, body),
        )),
        (req, dst) => Err(TransformError::UnsupportedPair {
            src: req.proto(),
            dst,
        }),
    }
}

/// Translate a provider response back into the caller dialect.
pub fn transform_response(
    caller: Proto,
    model: &str,
    resp: GenerateResponse,
) -> Result<GenerateResponse, TransformError> {
    match (resp, caller) {
        (GenerateResponse::OpenAI(resp), Proto::OpenAI) => Ok(GenerateResponse::OpenAI(resp)),
        (GenerateResponse::Claude(resp), Proto::Claude) => Ok(GenerateResponse::Claude(resp)),
        (GenerateResponse::Gemini(resp), Proto::Gemini) => Ok(GenerateResponse::Gemini(resp)),
        (GenerateResponse::Claude(resp), Proto::OpenAI) => Ok(GenerateResponse::OpenAI(
            generate::openai2claude::response(resp),
        )),
        (GenerateResponse::Gemini(resp), Proto::OpenAI) => Ok(GenerateResponse::OpenAI(
            generate::openai2gemini::response(model, resp),
        )),
        (GenerateResponse::OpenAI(resp), Proto::Claude) => Ok(GenerateResponse::Claude(
            generate::claude2openai::response(resp),
        )),
        (GenerateResponse::Gemini(resp), Proto::Claude) => Ok(GenerateResponse::Claude(
            generate::claude2gemini::response(model, resp),
        )),
        (GenerateResponse::OpenAI(resp), Proto::Gemini) => Ok(GenerateResponse::Gemini(
            generate::gemini2openai::response(resp),
        )),
        (GenerateResponse::Claude(resp), Proto::Gemini) => Ok(GenerateResponse::Gemini(
            generate::gemini2claude::response(resp),
        )),
    }
}

/// Stateful translator turning provider stream events into caller events.
pub trait StreamTranslator: Send {
    fn on_event(&mut self, event: StreamEvent) -> Vec<StreamEvent>;
    /// Flush buffered state at end of upstream stream.
    fn finish(&mut self) -> Vec<StreamEvent>;
}

/// Passthrough for matching dialects.
#[derive(Debug, Default)]
struct IdentityTranslator;

impl StreamTranslator for IdentityTranslator {
    fn on_event(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        vec![event]
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        Vec::new()
    }
}

/// Build the stream translator for a (provider, caller) pair. The `model`
/// is the caller-visible model name stamped into synthesized envelopes.
pub fn stream_translator(provider: Proto, caller: Proto, model: &str) -> Box<dyn StreamTranslator> {
    match (provider, caller) {
        (p, c) if p == c => Box::new(IdentityTranslator),
        (Proto::Claude, Proto::OpenAI) => {
            Box::new(generate::openai2claude::ClaudeToOpenAiStream::new(model))
        }
        (Proto::Gemini, Proto::OpenAI) => {
            Box::new(generate::openai2gemini::GeminiToOpenAiStream::new(model))
        }
        (Proto::OpenAI, Proto::Claude) => {
            Box::new(generate::claude2openai::OpenAiToClaudeStream::new(model))
        }
        (Proto::Gemini, Proto::Claude) => {
            Box::new(generate::claude2gemini::GeminiToClaudeStream::new(model))
        }
        (Proto::OpenAI, Proto::Gemini) => {
            Box::new(generate::gemini2openai::OpenAiToGeminiStream::new())
        }
        (Proto::Claude, Proto::Gemini) => {
            Box::new(generate::gemini2claude::ClaudeToGeminiStream::new())
        }
        // Unreachable: the equal-proto arm above covers the diagonal.
        _ => Box::new(IdentityTranslator),
    }
}
