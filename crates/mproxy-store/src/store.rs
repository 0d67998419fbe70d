use async_trait::async_trait;

use crate::record::CredentialRecord;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("credential not found: {0}")]
    NotFound(String),
}

/// Persistence contract for credentials.
///
/// Writes are serialized per credential id by the implementation; runtime
/// reads use the in-memory mirror, not this trait.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_all(&self) -> StoreResult<Vec<CredentialRecord>>;

    /// Persist the record, preserving unknown fields already present in the
    /// file. Runtime-only records must never reach this method.
    async fn save(&self, record: &CredentialRecord) -> StoreResult<()>;

    async fn set_enabled(&self, id: &str, enabled: bool) -> StoreResult<()>;

    async fn delete(&self, id: &str) -> StoreResult<()>;
}
