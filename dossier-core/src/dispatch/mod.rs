//! Capability-bounded task dispatch with timeouts and retries.

mod lanes;
mod retry;

pub use retry::RetryPolicy;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use dossier_model::{InvestigationID, Priority, TaskID, TaskStatus};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, warn, Instrument};

use crate::config::{DispatchConfig, RetryConfig};
use crate::error::Result;
use crate::registry::{Capability, CapabilityRegistry};
use crate::worker::{Outcome, TaskPayload, WorkContext, WorkProduct, WorkerError};

use lanes::{LaneSet, QueuedTask};

/// One task handed to the dispatcher.
#[derive(Clone, Debug)]
pub struct DispatchRequest {
    pub task_id: TaskID,
    pub investigation_id: InvestigationID,
    pub capability: Capability,
    pub priority: Priority,
    pub payload: TaskPayload,
    /// Fires on investigation or phase cancellation.
    pub cancel: CancellationToken,
}

/// Final state of a task as seen by the dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub enum Disposition {
    Completed(WorkProduct),
    Failed(WorkerError),
    TimedOut(WorkerError),
    Cancelled(String),
}

impl Disposition {
    pub fn status(&self) -> TaskStatus {
        match self {
            Disposition::Completed(_) => TaskStatus::Completed,
            Disposition::Failed(_) => TaskStatus::Failed,
            Disposition::TimedOut(_) => TaskStatus::TimedOut,
            Disposition::Cancelled(_) => TaskStatus::Cancelled,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            Disposition::Completed(_) => None,
            Disposition::Failed(err) | Disposition::TimedOut(err) => Some(err.message.clone()),
            Disposition::Cancelled(reason) => Some(reason.clone()),
        }
    }
}

/// Terminal report for a task, delivered exactly once per task.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskReport {
    pub task_id: TaskID,
    pub investigation_id: InvestigationID,
    pub attempts: u32,
    pub disposition: Disposition,
}

impl TaskReport {
    pub fn cancelled(request: &DispatchRequest, attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            task_id: request.task_id,
            investigation_id: request.investigation_id,
            attempts,
            disposition: Disposition::Cancelled(reason.into()),
        }
    }

    /// Collapses the report into the single-dispatch outcome shape.
    pub fn into_outcome(self) -> Outcome {
        match self.disposition {
            Disposition::Completed(product) => Outcome::Success(product),
            Disposition::Failed(err) | Disposition::TimedOut(err) => Outcome::Fatal(err),
            Disposition::Cancelled(reason) => Outcome::Fatal(WorkerError::new(reason)),
        }
    }
}

/// Progress emitted while a task moves through the dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchNotice {
    Started {
        task_id: TaskID,
        investigation_id: InvestigationID,
        attempt: u32,
        worker: String,
    },
    Retrying {
        task_id: TaskID,
        investigation_id: InvestigationID,
        attempt: u32,
        error: WorkerError,
        delay: Duration,
    },
    Finished(TaskReport),
}

/// Cloneable handle over the shared dispatcher state.
#[derive(Clone)]
pub struct TaskDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: Arc<CapabilityRegistry>,
    config: DispatchConfig,
    retry: RetryPolicy,
    lanes: Mutex<LaneSet>,
    paused: DashSet<InvestigationID>,
    shutdown: CancellationToken,
}

impl fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lanes = self
            .inner
            .lanes
            .try_lock()
            .map(|guard| guard.snapshot())
            .unwrap_or_default();
        f.debug_struct("TaskDispatcher")
            .field("config", &self.inner.config)
            .field("retry", &self.inner.retry)
            .field("lanes", &lanes)
            .field("paused", &self.inner.paused.len())
            .field("shutdown_cancelled", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl TaskDispatcher {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        config: DispatchConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                config,
                retry: RetryPolicy::new(retry),
                lanes: Mutex::new(LaneSet::default()),
                paused: DashSet::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.inner.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    /// Queues a task without waiting for it. Progress and the terminal
    /// report arrive on `notices`. Malformed payloads are rejected here.
    pub async fn submit(
        &self,
        request: DispatchRequest,
        notices: mpsc::Sender<DispatchNotice>,
    ) -> Result<()> {
        self.inner
            .registry
            .validate_payload(&request.capability, &request.payload)?;
        debug!(
            task = %request.task_id,
            investigation = %request.investigation_id,
            capability = %request.capability,
            priority = %request.priority,
            "task queued"
        );
        self.inner.enqueue(1, request, notices).await;
        Ok(())
    }

    /// Runs a task through the full retry policy and waits for its outcome.
    pub async fn dispatch(&self, request: DispatchRequest) -> Outcome {
        let (tx, mut rx) = mpsc::channel(16);
        if let Err(err) = self.submit(request, tx).await {
            return Outcome::fatal(err.to_string());
        }
        while let Some(notice) = rx.recv().await {
            if let DispatchNotice::Finished(report) = notice {
                return report.into_outcome();
            }
        }
        Outcome::fatal("dispatcher dropped the task without a report")
    }

    /// Holds queued tasks of the investigation. In-flight attempts finish.
    pub fn pause(&self, investigation_id: InvestigationID) {
        self.inner.paused.insert(investigation_id);
    }

    pub async fn resume(&self, investigation_id: InvestigationID) {
        if self.inner.paused.remove(&investigation_id).is_some() {
            let caps = self.inner.lanes.lock().await.capabilities();
            for cap in caps {
                self.inner.drain(&cap).await;
            }
        }
    }

    pub fn is_paused(&self, investigation_id: &InvestigationID) -> bool {
        self.inner.paused.contains(investigation_id)
    }

    /// Drops queued tasks whose cancellation token fired and returns their
    /// reports. The caller owns delivery of these reports.
    pub async fn purge_cancelled(&self, investigation_id: InvestigationID) -> Vec<TaskReport> {
        let purged = self.inner.lanes.lock().await.purge_cancelled(investigation_id);
        purged
            .into_iter()
            .map(|entry| {
                TaskReport::cancelled(&entry.request, entry.attempt - 1, "cancelled before dispatch")
            })
            .collect()
    }

    pub fn forget(&self, investigation_id: &InvestigationID) {
        self.inner.paused.remove(investigation_id);
    }

    /// (in-flight, queued) per capability.
    pub async fn lane_snapshot(&self) -> HashMap<Capability, (usize, usize)> {
        self.inner.lanes.lock().await.snapshot()
    }

    /// Stops backoff sleeps. Running attempts observe their own tokens.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl DispatcherInner {
    fn limit_for(&self, capability: &Capability) -> usize {
        self.config
            .override_for(capability.as_str())
            .and_then(|o| o.max_concurrency)
            .or_else(|| {
                self.registry
                    .get(capability)
                    .and_then(|entry| entry.descriptor.max_concurrency)
            })
            .unwrap_or(self.config.default_max_concurrency)
            .max(1)
    }

    fn timeout_for(&self, capability: &Capability) -> Duration {
        self.config
            .override_for(capability.as_str())
            .and_then(|o| o.timeout_ms)
            .map(Duration::from_millis)
            .or_else(|| {
                self.registry
                    .get(capability)
                    .and_then(|entry| entry.descriptor.timeout)
            })
            .unwrap_or(Duration::from_millis(self.config.default_timeout_ms))
    }

    async fn enqueue(
        self: &Arc<Self>,
        attempt: u32,
        request: DispatchRequest,
        notices: mpsc::Sender<DispatchNotice>,
    ) {
        let cap = request.capability.clone();
        let limit = self.limit_for(&cap);
        self.lanes.lock().await.push(limit, attempt, request, notices);
        self.drain(&cap).await;
    }

    async fn drain(self: &Arc<Self>, capability: &Capability) {
        let released = {
            let mut lanes = self.lanes.lock().await;
            lanes.take_ready(capability, |inv| self.paused.contains(inv))
        };

        for entry in released.cancelled {
            let report = TaskReport::cancelled(&entry.request, entry.attempt - 1, "cancelled before dispatch");
            let notices = entry.notices;
            tokio::spawn(async move {
                if notices.send(DispatchNotice::Finished(report)).await.is_err() {
                    warn!("cancelled task report dropped, receiver closed");
                }
            });
        }

        for entry in released.ready {
            self.spawn_attempt(entry);
        }
    }

    fn spawn_attempt(self: &Arc<Self>, entry: QueuedTask) {
        let inner = Arc::clone(self);
        let span = debug_span!(
            "dispatch",
            task = %entry.request.task_id,
            capability = %entry.request.capability,
            attempt = entry.attempt
        );
        tokio::spawn(async move { inner.run_attempt(entry).await }.instrument(span));
    }

    async fn run_attempt(self: Arc<Self>, entry: QueuedTask) {
        let QueuedTask {
            attempt,
            request,
            notices,
            ..
        } = entry;
        let cap = request.capability.clone();

        let worker = match self.registry.worker_for(&cap, attempt) {
            Ok(worker) => worker,
            Err(err) => {
                let report = TaskReport {
                    task_id: request.task_id,
                    investigation_id: request.investigation_id,
                    attempts: attempt,
                    disposition: Disposition::Failed(WorkerError::new(err.to_string())),
                };
                self.finish(&cap, &notices, report).await;
                return;
            }
        };

        let started = DispatchNotice::Started {
            task_id: request.task_id,
            investigation_id: request.investigation_id,
            attempt,
            worker: worker.name().to_string(),
        };
        if notices.send(started).await.is_err() {
            debug!("start notice dropped, receiver closed");
        }

        let timeout = self.timeout_for(&cap);
        let ctx = WorkContext {
            investigation_id: request.investigation_id,
            task_id: request.task_id,
            attempt,
            deadline: Instant::now() + timeout,
            cancel: request.cancel.clone(),
        };

        let outcome = match tokio::time::timeout(
            timeout,
            worker.execute(&cap, &request.payload, &ctx),
        )
        .await
        {
            Ok(outcome) => self.check_product(&cap, worker.name(), outcome),
            Err(_) => Outcome::Retryable(WorkerError::timeout(timeout.as_millis())),
        };

        let cancelled = request.cancel.is_cancelled();
        let disposition = match outcome {
            Outcome::Success(product) => Disposition::Completed(product),
            Outcome::Fatal(_) | Outcome::Retryable(_) if cancelled => {
                Disposition::Cancelled("cancelled during attempt".into())
            }
            Outcome::Fatal(err) => Disposition::Failed(err),
            Outcome::Retryable(err) if self.retry.should_retry(attempt) => {
                self.retry_later(attempt, request, notices, err).await;
                return;
            }
            Outcome::Retryable(err) if err.timed_out => Disposition::TimedOut(err),
            Outcome::Retryable(err) => Disposition::Failed(err),
        };

        let report = TaskReport {
            task_id: request.task_id,
            investigation_id: request.investigation_id,
            attempts: attempt,
            disposition,
        };
        self.finish(&cap, &notices, report).await;
    }

    /// Products must match the capability's declared kind.
    fn check_product(&self, capability: &Capability, worker: &str, outcome: Outcome) -> Outcome {
        let Outcome::Success(product) = &outcome else {
            return outcome;
        };
        match self.registry.descriptor(capability) {
            Ok(descriptor) if descriptor.kind == product.kind() => outcome,
            Ok(descriptor) => Outcome::fatal(format!(
                "worker {worker} returned a {} product for {} capability {capability}",
                product.kind(),
                descriptor.kind
            )),
            Err(err) => Outcome::fatal(err.to_string()),
        }
    }

    async fn retry_later(
        self: Arc<Self>,
        attempt: u32,
        request: DispatchRequest,
        notices: mpsc::Sender<DispatchNotice>,
        error: WorkerError,
    ) {
        let cap = request.capability.clone();
        let delay = self.retry.delay_for(request.task_id, attempt);
        warn!(
            task = %request.task_id,
            capability = %cap,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "attempt failed, retrying"
        );

        let notice = DispatchNotice::Retrying {
            task_id: request.task_id,
            investigation_id: request.investigation_id,
            attempt,
            error,
            delay,
        };
        if notices.send(notice).await.is_err() {
            debug!("retry notice dropped, receiver closed");
        }

        // the slot is free while we back off
        self.release(&cap).await;

        let cancel = request.cancel.clone();
        let shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                self.enqueue(attempt + 1, request, notices).await;
            }
            _ = cancel.cancelled() => {
                let report = TaskReport::cancelled(&request, attempt, "cancelled during backoff");
                let _ = notices.send(DispatchNotice::Finished(report)).await;
            }
            _ = shutdown.cancelled() => {
                let report = TaskReport::cancelled(&request, attempt, "dispatcher shutting down");
                let _ = notices.send(DispatchNotice::Finished(report)).await;
            }
        }
    }

    /// Reports before releasing the slot so observers never count more
    /// in-flight tasks than the bound.
    async fn finish(
        self: &Arc<Self>,
        capability: &Capability,
        notices: &mpsc::Sender<DispatchNotice>,
        report: TaskReport,
    ) {
        debug!(
            task = %report.task_id,
            status = %report.disposition.status(),
            attempts = report.attempts,
            "task finished"
        );
        if notices.send(DispatchNotice::Finished(report)).await.is_err() {
            warn!(capability = %capability, "task report dropped, receiver closed");
        }
        self.release(capability).await;
    }

    async fn release(self: &Arc<Self>, capability: &Capability) {
        self.lanes.lock().await.release(capability);
        self.drain(capability).await;
    }
}
