use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use dossier_model::InvestigationID;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::ProgressEvent;
use crate::error::{InvestigationError, Result};

/// Durable, strictly ordered per-investigation event log.
#[async_trait]
pub trait EventJournal: Send + Sync + fmt::Debug {
    /// Appends `event`. Its sequence must be exactly one past the last.
    async fn append(&self, event: &ProgressEvent) -> Result<()>;

    /// Up to `limit` events with sequence greater than `after`, in order.
    async fn read_after(
        &self,
        investigation_id: InvestigationID,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ProgressEvent>>;

    /// 0 when nothing has been journaled yet.
    async fn last_sequence(&self, investigation_id: InvestigationID) -> Result<u64>;
}

fn check_next(investigation_id: InvestigationID, last: u64, event: &ProgressEvent) -> Result<()> {
    if event.sequence != last + 1 {
        return Err(InvestigationError::ConsistencyViolation(format!(
            "event {} for {investigation_id} does not follow {last}",
            event.sequence
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct InMemoryJournal {
    events: DashMap<InvestigationID, Vec<ProgressEvent>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventJournal for InMemoryJournal {
    async fn append(&self, event: &ProgressEvent) -> Result<()> {
        let mut log = self.events.entry(event.investigation_id).or_default();
        let last = log.last().map_or(0, |e| e.sequence);
        check_next(event.investigation_id, last, event)?;
        log.push(event.clone());
        Ok(())
    }

    async fn read_after(
        &self,
        investigation_id: InvestigationID,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ProgressEvent>> {
        Ok(self
            .events
            .get(&investigation_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.sequence > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn last_sequence(&self, investigation_id: InvestigationID) -> Result<u64> {
        Ok(self
            .events
            .get(&investigation_id)
            .and_then(|log| log.last().map(|e| e.sequence))
            .unwrap_or(0))
    }
}

/// One JSON document per line in `<dir>/<investigation>.events.jsonl`.
///
/// The last sequence of each log is read from disk once and then tracked in
/// memory, so appends do not rescan the file. Appends for one investigation
/// must not race; the broadcaster already serializes them.
#[derive(Debug)]
pub struct JsonlJournal {
    dir: PathBuf,
    tails: DashMap<InvestigationID, u64>,
}

impl JsonlJournal {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            tails: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, investigation_id: InvestigationID) -> PathBuf {
        self.dir.join(format!("{investigation_id}.events.jsonl"))
    }

    /// Walks the log front to back, handing each event to `visit` until it
    /// returns false.
    async fn scan(
        &self,
        investigation_id: InvestigationID,
        mut visit: impl FnMut(ProgressEvent) -> bool + Send,
    ) -> Result<()> {
        let file = match tokio::fs::File::open(self.path_for(investigation_id)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: ProgressEvent = serde_json::from_str(&line)?;
            if !visit(event) {
                break;
            }
        }
        Ok(())
    }

    async fn tail(&self, investigation_id: InvestigationID) -> Result<u64> {
        if let Some(last) = self.tails.get(&investigation_id) {
            return Ok(*last);
        }
        let mut last = 0;
        self.scan(investigation_id, |event| {
            last = event.sequence;
            true
        })
        .await?;
        self.tails.insert(investigation_id, last);
        Ok(last)
    }
}

#[async_trait]
impl EventJournal for JsonlJournal {
    async fn append(&self, event: &ProgressEvent) -> Result<()> {
        let last = self.tail(event.investigation_id).await?;
        check_next(event.investigation_id, last, event)?;

        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(event.investigation_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        self.tails.insert(event.investigation_id, event.sequence);
        Ok(())
    }

    async fn read_after(
        &self,
        investigation_id: InvestigationID,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ProgressEvent>> {
        let mut page = Vec::new();
        if limit == 0 {
            return Ok(page);
        }
        self.scan(investigation_id, |event| {
            if event.sequence > after {
                page.push(event);
            }
            page.len() < limit
        })
        .await?;
        Ok(page)
    }

    async fn last_sequence(&self, investigation_id: InvestigationID) -> Result<u64> {
        self.tail(investigation_id).await
    }
}
