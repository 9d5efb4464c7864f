use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::{LoggedSymptom, NewSymptom};

pub const JOURNAL_KEY: &str = "ecobreath_symptoms";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode journal: {0}")]
    Json(#[from] serde_json::Error),
}

/// String key-value persistence. Values are read and written whole.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// One `<key>.json` file per key inside a directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&path, err)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| io_error(&self.dir, err))?;
        let path = self.path_for(key);
        // Readers never see a half-written array.
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, value)
            .await
            .map_err(|err| io_error(&staging, err))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|err| io_error(&path, err))
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&path, err)),
        }
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    entries: parking_lot::Mutex<std::collections::HashMap<String, String>>,
}

#[cfg(test)]
#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Newest-first log of user-reported symptoms.
pub struct SymptomJournal {
    store: Arc<dyn KvStore>,
}

impl SymptomJournal {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Unreadable or corrupt journals read as empty.
    pub async fn get_logs(&self) -> Vec<LoggedSymptom> {
        self.load().await.unwrap_or_else(|err| {
            error!(error = %err, "failed to read symptom journal");
            Vec::new()
        })
    }

    /// Store failures propagate; a corrupt value reads as empty.
    async fn load(&self) -> Result<Vec<LoggedSymptom>, StoreError> {
        let Some(raw) = self.store.get(JOURNAL_KEY).await? else {
            return Ok(Vec::new());
        };

        Ok(serde_json::from_str(&raw).unwrap_or_else(|err| {
            error!(error = %err, "failed to parse symptom journal");
            Vec::new()
        }))
    }

    pub async fn recent(&self, limit: usize) -> Vec<LoggedSymptom> {
        let mut logs = self.get_logs().await;
        logs.truncate(limit);
        logs
    }

    pub async fn add_log(&self, entry: NewSymptom) -> Result<LoggedSymptom, StoreError> {
        let mut logs = self.load().await?;
        let log = LoggedSymptom {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            symptom: entry.symptom,
            severity: entry.severity,
            notes: entry.notes,
        };

        logs.insert(0, log.clone());
        let encoded = serde_json::to_string(&logs)?;
        self.store.set(JOURNAL_KEY, &encoded).await?;
        info!(id = %log.id, symptom = %log.symptom, severity = %log.severity, "symptom logged");

        Ok(log)
    }

    pub async fn clear_logs(&self) -> Result<(), StoreError> {
        self.store.remove(JOURNAL_KEY).await
    }
}
