//! Protocol translation between the three dialects.
//!
//! Directed pair modules are named `<caller>2<provider>`: `request` maps the
//! caller's request into the provider dialect, `response` and the stream
//! translator map provider output back into the caller dialect.

pub mod dispatch;
pub mod generate;
pub mod wire;

pub use dispatch::{
    stream_translator, transform_request, transform_response, GenerateRequest, GenerateResponse,
    Proto, StreamEvent, StreamTranslator, TransformError,
};
pub use generate::{budget_to_effort, effort_to_budget};
pub use wire::{
    content_type_for_stream, encode_openai_done, encode_stream_event, StreamDecoder, StreamFormat,
};
