//! Credential persistence: one JSON file per credential under the auth dir,
//! mirrored into memory at startup.

mod file;
mod record;
mod store;

pub use file::FileCredentialStore;
pub use record::CredentialRecord;
pub use store::{CredentialStore, StoreError, StoreResult};
