//! Wire types for the three dialects mproxy speaks.
//!
//! These are deliberately lean: fields the gateway routes on or rewrites are
//! typed, everything else rides in `#[serde(flatten)]` extras so unknown
//! provider fields survive a round trip.

pub mod claude;
pub mod error;
pub mod gemini;
pub mod openai;
pub mod sse;

pub use error::{claude_error, gemini_error, openai_error, ErrorShape};
