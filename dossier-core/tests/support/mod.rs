//! Shared harness for orchestration integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use dossier_core::model::{InvestigationID, InvestigationStatus};
use dossier_core::worker::EvidenceDraft;
use dossier_core::{
    Capability, InvestigationService, InvestigationSnapshot, Outcome, TaskPayload, WorkContext,
    WorkProduct, Worker,
};

/// Upper bound for any single wait in these tests.
pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

pub fn draft(source_id: &str, reliability: u8, relevance: u8) -> EvidenceDraft {
    EvidenceDraft {
        source_id: source_id.to_string(),
        source_type: "web".to_string(),
        content: format!("content from {source_id}"),
        reliability,
        relevance,
        collected_at: None,
        verified: false,
        supersedes: None,
    }
}

/// Polls the investigation until `done` holds for its snapshot.
pub async fn wait_until(
    service: &InvestigationService,
    id: InvestigationID,
    done: impl Fn(&InvestigationSnapshot) -> bool,
) -> Result<InvestigationSnapshot> {
    let poll = async {
        loop {
            let snapshot = service.get_status(id).await?;
            if done(&snapshot) {
                return Ok::<_, anyhow::Error>(snapshot);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(WAIT_LIMIT, poll)
        .await
        .context("investigation did not reach the expected state in time")?
}

pub async fn wait_for_status(
    service: &InvestigationService,
    id: InvestigationID,
    status: InvestigationStatus,
) -> Result<InvestigationSnapshot> {
    let snapshot = wait_until(service, id, |s| s.status == status || s.status.is_terminal()).await?;
    if snapshot.status != status {
        bail!(
            "expected {status}, investigation ended {} ({:?})",
            snapshot.status,
            snapshot.failure_reason
        );
    }
    Ok(snapshot)
}

/// Collection worker that records how many attempts overlap.
#[derive(Debug, Default)]
pub struct GaugeWorker {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicUsize,
    latency: Duration,
}

impl GaugeWorker {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for GaugeWorker {
    fn name(&self) -> &str {
        "gauge"
    }

    async fn execute(&self, _capability: &Capability, payload: &TaskPayload, ctx: &WorkContext) -> Outcome {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let cancelled = tokio::select! {
            _ = ctx.cancel.cancelled() => true,
            _ = tokio::time::sleep(self.latency) => false,
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);

        if cancelled {
            return Outcome::retryable("cancelled");
        }
        let label = payload.target().map_or("unknown", |t| t.label.as_str());
        Outcome::Success(WorkProduct::Evidence {
            items: vec![draft(label, 80, 90)],
        })
    }
}

pub fn gauge(latency: Duration) -> Arc<GaugeWorker> {
    Arc::new(GaugeWorker::new(latency))
}
