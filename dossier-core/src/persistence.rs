use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use dossier_model::InvestigationID;
use tracing::debug;

use crate::error::{InvestigationError, Result};
use crate::record::InvestigationRecord;

/// Durable home of investigation records. `save` is atomic per call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InvestigationStore: Send + Sync {
    async fn load(&self, id: InvestigationID) -> Result<InvestigationRecord>;

    async fn save(&self, record: &InvestigationRecord) -> Result<()>;

    async fn list(&self) -> Result<Vec<InvestigationID>>;
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: DashMap<InvestigationID, InvestigationRecord>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvestigationStore for InMemoryStore {
    async fn load(&self, id: InvestigationID) -> Result<InvestigationRecord> {
        self.records
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| InvestigationError::NotFound(format!("investigation {id}")))
    }

    async fn save(&self, record: &InvestigationRecord) -> Result<()> {
        self.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<InvestigationID>> {
        let mut ids: Vec<_> = self.records.iter().map(|r| *r.key()).collect();
        ids.sort();
        Ok(ids)
    }
}

/// One pretty-printed JSON document per investigation under `dir`.
/// Writes go to a temp file in the same directory and are renamed into
/// place.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

const RECORD_SUFFIX: &str = ".record.json";

impl JsonFileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| InvestigationError::Persistence(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: InvestigationID) -> PathBuf {
        self.dir.join(format!("{id}{RECORD_SUFFIX}"))
    }
}

#[async_trait]
impl InvestigationStore for JsonFileStore {
    async fn load(&self, id: InvestigationID) -> Result<InvestigationRecord> {
        let bytes = match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(InvestigationError::NotFound(format!("investigation {id}")));
            }
            Err(e) => return Err(InvestigationError::Persistence(format!("read {id}: {e}"))),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn save(&self, record: &InvestigationRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let dir = self.dir.clone();
        let path = self.path_for(record.id);

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| InvestigationError::Persistence(format!("save task aborted: {e}")))?
        .map_err(|e| InvestigationError::Persistence(format!("save {}: {e}", record.id)))?;

        debug!(investigation = %record.id, "record saved");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<InvestigationID>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| InvestigationError::Persistence(format!("list {}: {e}", self.dir.display())))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(RECORD_SUFFIX)) else {
                continue;
            };
            if let Ok(id) = stem.parse::<InvestigationID>() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
