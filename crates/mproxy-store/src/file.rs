use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::record::CredentialRecord;
use crate::store::{CredentialStore, StoreError, StoreResult};

/// One JSON file per credential under the auth directory.
///
/// Writes go through a temp file + rename so a crash never leaves a
/// half-written credential, and re-read the existing file first so fields
/// this process does not know about survive the save.
pub struct FileCredentialStore {
    dir: PathBuf,
    /// Per-id write serialization.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn write_atomic(&self, path: &Path, value: &Value) -> StoreResult<()> {
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load_all(&self) -> StoreResult<Vec<CredentialRecord>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let data = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<CredentialRecord>(&data) {
                Ok(mut record) => {
                    record.id = stem.to_string();
                    records.push(record);
                }
                Err(err) => {
                    tracing::warn!(file = %path.display(), %err, "skipping unreadable credential file");
                }
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn save(&self, record: &CredentialRecord) -> StoreResult<()> {
        let lock = self.lock_for(&record.id).await;
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&record.id);

        // Merge over the existing file so unknown fields survive.
        let mut merged = match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice::<Value>(&data)
                .unwrap_or_else(|_| Value::Object(Default::default())),
            Err(_) => Value::Object(Default::default()),
        };
        let fresh = serde_json::to_value(record)?;
        if let (Some(target), Some(source)) = (merged.as_object_mut(), fresh.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        } else {
            merged = fresh;
        }

        self.write_atomic(&path, &merged).await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> StoreResult<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let path = self.path_for(id);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|_| StoreError::NotFound(id.to_string()))?;
        let mut value: Value = serde_json::from_slice(&data)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("disabled".to_string(), Value::Bool(!enabled));
        }
        self.write_atomic(&path, &value).await
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let path = self.path_for(id);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|_| StoreError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_provider_core::CredentialKind;

    fn record(id: &str) -> CredentialRecord {
        let mut record = CredentialRecord::new(id, "kiro", CredentialKind::OAuth);
        record.label = "user@example.com".to_string();
        record
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        store.save(&record("acct-1")).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "acct-1");
        assert_eq!(loaded[0].label, "user@example.com");
        assert!(!loaded[0].disabled);
    }

    #[tokio::test]
    async fn disabled_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        store.save(&record("acct-1")).await.unwrap();
        store.set_enabled("acct-1", false).await.unwrap();

        // Fresh store over the same directory simulates a process restart.
        let reopened = FileCredentialStore::new(dir.path());
        let loaded = reopened.load_all().await.unwrap();
        assert!(loaded[0].disabled);
    }

    #[tokio::test]
    async fn save_preserves_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        store.save(&record("acct-1")).await.unwrap();

        // An external tool annotates the file.
        let path = dir.path().join("acct-1.json");
        let mut value: Value =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("external_note".to_string(), Value::String("keep".into()));
        tokio::fs::write(&path, serde_json::to_vec(&value).unwrap())
            .await
            .unwrap();

        let mut updated = record("acct-1");
        updated.priority = 7;
        store.save(&updated).await.unwrap();

        let value: Value =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(value["external_note"], "keep");
        assert_eq!(value["priority"], 7);
    }

    #[tokio::test]
    async fn delete_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        store.save(&record("acct-1")).await.unwrap();
        store.delete("acct-1").await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
        assert!(matches!(
            store.delete("acct-1").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
