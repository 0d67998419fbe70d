//! The gateway error taxonomy and its caller-format envelopes.

use std::time::Duration;

use mproxy_protocol::error as protocol_error;
use mproxy_transform::Proto;
use serde_json::Value;

#[derive(Debug)]
pub enum GatewayError {
    /// Malformed request, missing model, unsupported caller shape.
    InvalidRequest(String),
    /// No registration and no mapping for the requested model.
    ModelNotFound(String),
    /// Caller failed authentication.
    Unauthorized(String),
    /// No Ready client: everything is cooling down or suspended.
    NoCapacity { retry_after: Option<Duration> },
    /// 5xx / transport failures that exhausted their retries.
    UpstreamTransient(String),
    /// Terminal upstream error surfaced in the caller's envelope.
    Upstream { status: u16, body: Vec<u8> },
    /// Assertion failures, translator bugs. Never retried.
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::ModelNotFound(_) => 404,
            GatewayError::Unauthorized(_) => 401,
            GatewayError::NoCapacity { .. } => 503,
            GatewayError::UpstreamTransient(_) => 502,
            GatewayError::Upstream { status, .. } => *status,
            GatewayError::Internal(_) => 500,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::NoCapacity { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Error body in the caller's envelope.
    pub fn body(&self, caller: Proto) -> Value {
        let status = self.status();
        match self {
            GatewayError::Upstream { body, .. } => {
                protocol_error::reshape(shape_for(caller), status, body)
            }
            GatewayError::InvalidRequest(message) => match caller {
                Proto::OpenAI => protocol_error::openai_error("invalid_request_error", message),
                Proto::Claude => protocol_error::claude_error("invalid_request_error", message),
                Proto::Gemini => {
                    protocol_error::gemini_error(status, "INVALID_ARGUMENT", message)
                }
            },
            GatewayError::ModelNotFound(model) => {
                let message = format!("model not found: {model}");
                match caller {
                    Proto::OpenAI => protocol_error::openai_error("not_found_error", &message),
                    Proto::Claude => protocol_error::claude_error("not_found_error", &message),
                    Proto::Gemini => {
                        protocol_error::gemini_error(status, "NOT_FOUND", &message)
                    }
                }
            }
            GatewayError::Unauthorized(message) => match caller {
                Proto::OpenAI => protocol_error::openai_error("authentication_error", message),
                Proto::Claude => protocol_error::claude_error("authentication_error", message),
                Proto::Gemini => {
                    protocol_error::gemini_error(status, "UNAUTHENTICATED", message)
                }
            },
            GatewayError::NoCapacity { .. } => {
                let message = "no available provider for this model";
                match caller {
                    Proto::OpenAI => protocol_error::openai_error("overloaded_error", message),
                    Proto::Claude => protocol_error::claude_error("overloaded_error", message),
                    Proto::Gemini => {
                        protocol_error::gemini_error(status, "UNAVAILABLE", message)
                    }
                }
            }
            GatewayError::UpstreamTransient(message) => match caller {
                Proto::OpenAI => protocol_error::openai_error("api_error", message),
                Proto::Claude => protocol_error::claude_error("api_error", message),
                Proto::Gemini => protocol_error::gemini_error(status, "UNAVAILABLE", message),
            },
            GatewayError::Internal(message) => match caller {
                Proto::OpenAI => protocol_error::openai_error("api_error", message),
                Proto::Claude => protocol_error::claude_error("api_error", message),
                Proto::Gemini => protocol_error::gemini_error(status, "INTERNAL", message),
            },
        }
    }
}

fn shape_for(caller: Proto) -> protocol_error::ErrorShape {
    match caller {
        Proto::OpenAI => protocol_error::ErrorShape::OpenAI,
        Proto::Claude => protocol_error::ErrorShape::Claude,
        Proto::Gemini => protocol_error::ErrorShape::Gemini,
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::InvalidRequest(m) => write!(f, "invalid request: {m}"),
            GatewayError::ModelNotFound(m) => write!(f, "model not found: {m}"),
            GatewayError::Unauthorized(m) => write!(f, "unauthorized: {m}"),
            GatewayError::NoCapacity { .. } => write!(f, "no available provider"),
            GatewayError::UpstreamTransient(m) => write!(f, "upstream unavailable: {m}"),
            GatewayError::Upstream { status, .. } => {
                write!(f, "upstream error (status {status})")
            }
            GatewayError::Internal(m) => write!(f, "internal error: {m}"),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(GatewayError::InvalidRequest("x".into()).status(), 400);
        assert_eq!(GatewayError::ModelNotFound("m".into()).status(), 404);
        assert_eq!(
            GatewayError::NoCapacity { retry_after: None }.status(),
            503
        );
        assert_eq!(GatewayError::UpstreamTransient("t".into()).status(), 502);
    }

    #[test]
    fn upstream_body_is_reshaped_per_caller() {
        let err = GatewayError::Upstream {
            status: 429,
            body: br#"{"error":{"message":"quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#
                .to_vec(),
        };
        let openai = err.body(Proto::OpenAI);
        assert_eq!(openai["error"]["type"], "rate_limit_error");
        assert_eq!(openai["error"]["message"], "quota exceeded");

        let claude = err.body(Proto::Claude);
        assert_eq!(claude["type"], "error");
        assert_eq!(claude["error"]["type"], "rate_limit_error");

        let gemini = err.body(Proto::Gemini);
        assert_eq!(gemini["error"]["status"], "RESOURCE_EXHAUSTED");
    }
}
