//! Error envelopes per dialect, plus reshaping of upstream error bodies into
//! the caller's envelope.

use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorShape {
    OpenAI,
    Claude,
    Gemini,
}

pub fn openai_error(kind: &str, message: &str) -> Value {
    json!({
        "error": {
            "message": message,
            "type": kind,
        }
    })
}

pub fn claude_error(kind: &str, message: &str) -> Value {
    json!({
        "type": "error",
        "error": {
            "type": kind,
            "message": message,
        }
    })
}

pub fn gemini_error(status: u16, google_status: &str, message: &str) -> Value {
    json!({
        "error": {
            "code": status,
            "message": message,
            "status": google_status,
        }
    })
}

/// Best-effort extraction of a human-readable message from any of the three
/// provider error envelopes (or a raw string body).
pub fn extract_message(body: &[u8]) -> String {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return String::from_utf8_lossy(body).trim().to_string();
    };
    let error = value.get("error").unwrap_or(&value);
    if let Some(message) = error.get("message").and_then(Value::as_str) {
        return message.to_string();
    }
    if let Some(message) = error.as_str() {
        return message.to_string();
    }
    error.to_string()
}

/// Reshape an upstream error body into the caller's envelope.
pub fn reshape(shape: ErrorShape, status: u16, body: &[u8]) -> Value {
    let message = extract_message(body);
    match shape {
        ErrorShape::OpenAI => openai_error(openai_kind(status), &message),
        ErrorShape::Claude => claude_error(claude_kind(status), &message),
        ErrorShape::Gemini => gemini_error(status, google_status(status), &message),
    }
}

fn openai_kind(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        401 | 403 => "authentication_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        500..=599 => "api_error",
        _ => "api_error",
    }
}

fn claude_kind(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        529 => "overloaded_error",
        500..=599 => "api_error",
        _ => "api_error",
    }
}

fn google_status(status: u16) -> &'static str {
    match status {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        503 => "UNAVAILABLE",
        500..=599 => "INTERNAL",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reshapes_openai_body_into_claude_envelope() {
        let body = br#"{"error":{"message":"boom","type":"api_error"}}"#;
        let value = reshape(ErrorShape::Claude, 500, body);
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["type"], "api_error");
        assert_eq!(value["error"]["message"], "boom");
    }

    #[test]
    fn reshapes_plain_text_into_gemini_envelope() {
        let value = reshape(ErrorShape::Gemini, 429, b"quota exceeded");
        assert_eq!(value["error"]["status"], "RESOURCE_EXHAUSTED");
        assert_eq!(value["error"]["code"], 429);
        assert_eq!(value["error"]["message"], "quota exceeded");
    }
}
