//! Request orchestration: access control, inbound classification, the
//! routing engine, and runtime state wiring.

pub mod access;
pub mod bootstrap;
pub mod classify;
pub mod engine;
pub mod error;
pub mod state;
pub mod upstream;
pub mod usage;

pub use access::{AccessDenied, AccessManager, AccessOutcome, AccessProvider, Principal};
pub use bootstrap::{bootstrap, BootConfig, BootstrapError, Runtime};
pub use classify::{classify_request, InboundCall, RouteRequest};
pub use engine::{Engine, GenerateOutcome, RouteBinding};
pub use error::GatewayError;
pub use state::AppState;
pub use upstream::{UpstreamClient, WreqUpstreamClient};
