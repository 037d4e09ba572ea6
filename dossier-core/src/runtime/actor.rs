use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dossier_model::{InvestigationStatus, Phase, TargetID, TaskID, TaskStatus};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ActorCommand;
use crate::aggregator::{EvidenceAggregator, IngestOutcome};
use crate::broadcast::{EventType, ProgressBroadcaster};
use crate::config::{OrchestratorConfig, Sequencing};
use crate::dispatch::{
    DispatchNotice, DispatchRequest, Disposition, TaskDispatcher, TaskReport,
};
use crate::error::{InvestigationError, Result};
use crate::persistence::InvestigationStore;
use crate::phase::{PhasePolicy, PhaseVerdict, PlannedTask, activate_targets, capability_groups};
use crate::record::{AgentTask, InvestigationRecord, InvestigationSnapshot, TransitionKind};
use crate::scoring;
use crate::worker::WorkerError;

/// Everything an actor shares with its siblings.
#[derive(Clone)]
pub(crate) struct ActorDeps {
    pub(crate) config: Arc<OrchestratorConfig>,
    pub(crate) dispatcher: TaskDispatcher,
    pub(crate) aggregator: EvidenceAggregator,
    pub(crate) policy: PhasePolicy,
    pub(crate) broadcaster: Arc<ProgressBroadcaster>,
    pub(crate) store: Arc<dyn InvestigationStore>,
}

impl fmt::Debug for ActorDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorDeps")
            .field("dispatcher", &self.dispatcher)
            .field("broadcaster", &self.broadcaster)
            .finish_non_exhaustive()
    }
}

enum Wake {
    Shutdown,
    Command(ActorCommand),
    Notice(DispatchNotice),
    Tick,
}

/// Sole owner and writer of one investigation record. Control commands,
/// dispatcher notices and dwell ticks are serialized through its loop.
pub(crate) struct InvestigationActor {
    deps: ActorDeps,
    record: InvestigationRecord,
    control: mpsc::Receiver<ActorCommand>,
    notices_tx: mpsc::Sender<DispatchNotice>,
    notices: mpsc::Receiver<DispatchNotice>,
    /// Parent of every phase token. Fires on failure and shutdown.
    investigation_token: CancellationToken,
    phase_token: CancellationToken,
    /// Capability groups created but not yet submitted.
    deferred: VecDeque<Vec<TaskID>>,
    paused_at: Option<DateTime<Utc>>,
    status_before_pause: InvestigationStatus,
    cancel_waiters: Vec<oneshot::Sender<Result<InvestigationSnapshot>>>,
    shutdown: CancellationToken,
    stopped: bool,
}

impl fmt::Debug for InvestigationActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvestigationActor")
            .field("investigation", &self.record.id)
            .field("status", &self.record.status)
            .field("phase", &self.record.phase)
            .field("deferred_groups", &self.deferred.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl InvestigationActor {
    pub(crate) fn new(
        deps: ActorDeps,
        record: InvestigationRecord,
        control: mpsc::Receiver<ActorCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        let (notices_tx, notices) = mpsc::channel(deps.config.runtime.mailbox_capacity.max(1));
        let investigation_token = CancellationToken::new();
        let phase_token = investigation_token.child_token();
        let status_before_pause = running_status(record.phase);
        Self {
            deps,
            record,
            control,
            notices_tx,
            notices,
            investigation_token,
            phase_token,
            deferred: VecDeque::new(),
            paused_at: None,
            status_before_pause,
            cancel_waiters: Vec::new(),
            shutdown,
            stopped: false,
        }
    }

    /// Opens PLANNING for a fresh record, then serves the mailbox.
    pub(crate) async fn run_new(mut self) {
        let summary = format!(
            "{} started with {} target(s)",
            self.record.title,
            self.record.targets.len()
        );
        self.emit(EventType::InvestigationStarted, summary).await;

        match self.open_phase(Phase::Planning, TransitionKind::Opened).await {
            Ok(()) => self.drive().await,
            Err(err) => self.escalate(err).await,
        }
        self.run().await;
    }

    /// Re-dispatches the open phase's unfinished tasks of a loaded record,
    /// then serves the mailbox.
    pub(crate) async fn run_recovered(mut self) {
        self.restore().await;
        self.run().await;
    }

    async fn run(mut self) {
        let period = Duration::from_millis(self.deps.config.runtime.tick_interval_ms.max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.stopped {
            let wake = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                Some(command) = self.control.recv() => Wake::Command(command),
                Some(notice) = self.notices.recv() => Wake::Notice(notice),
                _ = tick.tick() => Wake::Tick,
            };

            match wake {
                Wake::Shutdown => {
                    self.on_shutdown().await;
                    break;
                }
                Wake::Command(command) => self.on_command(command).await,
                Wake::Notice(notice) => self.on_notice(notice).await,
                Wake::Tick => self.drive().await,
            }
        }
        debug!(investigation = %self.record.id, status = %self.record.status, "investigation actor stopped");
    }

    async fn restore(&mut self) {
        let id = self.record.id;
        let status = self.record.status;
        if status == InvestigationStatus::Paused {
            self.deps.dispatcher.pause(id);
            self.paused_at = Some(Utc::now());
        }

        let live: Vec<(TaskID, bool)> = self
            .record
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| (t.id, t.phase == self.record.phase && t.epoch == self.record.phase_epoch))
            .collect();

        let mut resubmitted = 0usize;
        for (task_id, current) in live {
            if status.is_terminal() || !current {
                let report = self.cancelled_report(task_id, "abandoned on recovery");
                if let Some(report) = report
                    && let Err(err) = self.apply(report).await
                {
                    self.escalate(err).await;
                    return;
                }
                continue;
            }

            if let Some(task) = self.record.tasks.get_mut(&task_id) {
                if let Err(err) = task.transition(TaskStatus::Pending) {
                    warn!(task = %task_id, error = %err, "task could not be reset");
                    continue;
                }
                task.annotate("re-dispatched after recovery");
            }
            if let Err(err) = self.submit(task_id).await {
                self.escalate(err).await;
                return;
            }
            resubmitted += 1;
        }

        info!(
            investigation = %id,
            status = %status,
            phase = %self.record.phase,
            resubmitted,
            "investigation recovered"
        );
        if let Err(err) = self.persist().await {
            self.escalate(err).await;
            return;
        }
        self.drive().await;
    }

    async fn on_command(&mut self, command: ActorCommand) {
        match command {
            ActorCommand::Pause(reply) => {
                let result = self.pause().await;
                let _ = reply.send(result);
            }
            ActorCommand::Resume(reply) => {
                let result = self.resume().await;
                let _ = reply.send(result);
                self.drive().await;
            }
            ActorCommand::Cancel { reason, reply } => self.cancel(reason, reply).await,
            ActorCommand::CancelPhase(reply) => {
                let result = self.cancel_phase().await;
                let _ = reply.send(result);
                self.drive().await;
            }
            ActorCommand::Reopen { phase, reply } => {
                let result = self.reopen(phase).await;
                let _ = reply.send(result);
                self.drive().await;
            }
            ActorCommand::Snapshot(reply) => {
                let _ = reply.send(self.record.snapshot());
            }
            ActorCommand::Archive(reply) => {
                let result = self.archive().await;
                let _ = reply.send(result);
            }
        }
    }

    async fn on_notice(&mut self, notice: DispatchNotice) {
        match notice {
            DispatchNotice::Started {
                task_id,
                attempt,
                worker,
                ..
            } => self.on_started(task_id, attempt, &worker).await,
            DispatchNotice::Retrying {
                task_id,
                attempt,
                error,
                delay,
                ..
            } => self.on_retrying(task_id, attempt, &error, delay).await,
            DispatchNotice::Finished(report) => {
                if let Err(err) = self.apply(report).await {
                    self.escalate(err).await;
                    return;
                }
                self.drive().await;
                if let Err(err) = self.persist().await {
                    self.escalate(err).await;
                }
                self.answer_cancel_waiters();
            }
        }
    }

    async fn on_started(&mut self, task_id: TaskID, attempt: u32, worker: &str) {
        let Some(task) = self.record.tasks.get_mut(&task_id) else {
            warn!(task = %task_id, "start notice for unknown task");
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        if task.status != TaskStatus::InProgress && task.transition(TaskStatus::InProgress).is_err() {
            return;
        }
        task.attempts = attempt;
        let summary = format!("{} attempt {attempt} started on {worker}", task.capability);
        self.emit(EventType::TaskStarted, summary).await;
    }

    async fn on_retrying(&mut self, task_id: TaskID, attempt: u32, error: &WorkerError, delay: Duration) {
        let Some(task) = self.record.tasks.get_mut(&task_id) else {
            return;
        };
        if task.status.is_terminal() || task.transition(TaskStatus::Pending).is_err() {
            return;
        }
        task.annotate(format!(
            "attempt {attempt} failed: {error}; retrying in {}ms",
            delay.as_millis()
        ));
        let summary = format!("{} attempt {attempt} failed, retrying", task.capability);
        self.emit(EventType::TaskRetrying, summary).await;
    }

    /// Ingests a terminal report and mirrors what changed.
    async fn apply(&mut self, report: TaskReport) -> Result<()> {
        let IngestOutcome::Applied(summary) = self.deps.aggregator.ingest(&mut self.record, report)? else {
            return Ok(());
        };

        let (target, attempts) = self
            .record
            .tasks
            .get(&summary.task_id)
            .map(|t| (t.target, t.attempts))
            .unwrap_or((None, 0));
        let mut text = format!(
            "{} for {} {} after {attempts} attempt(s)",
            summary.capability,
            self.target_label(target),
            summary.status
        );
        if let Some(err) = &summary.error {
            text.push_str(&format!(": {err}"));
        }
        self.emit(EventType::TaskFinished, text).await;

        if !summary.evidence.is_empty() {
            let text = format!(
                "{} evidence item(s) for {} from {}",
                summary.evidence.len(),
                self.target_label(target),
                summary.capability
            );
            self.emit(EventType::EvidenceAdded, text).await;
        }
        for (target_id, status) in &summary.targets {
            let text = format!("{} {status}", self.target_label(Some(*target_id)));
            self.emit(EventType::TargetSettled, text).await;
        }
        if !summary.evidence.is_empty() || !summary.targets.is_empty() {
            let text = format!(
                "confidence {:.3}, completeness {:.3}",
                summary.confidence, summary.completeness
            );
            self.emit(EventType::ConfidenceUpdated, text).await;
        }
        Ok(())
    }

    /// Advances through every phase whose exit predicate already holds.
    async fn drive(&mut self) {
        loop {
            if self.record.status.is_terminal() || self.record.status == InvestigationStatus::Paused {
                return;
            }
            if let Err(err) = self.release_next_group().await {
                self.escalate(err).await;
                return;
            }

            let kind = match self.deps.policy.evaluate(&self.record, Utc::now()) {
                PhaseVerdict::Pending => return,
                PhaseVerdict::Satisfied => TransitionKind::Satisfied,
                PhaseVerdict::Exhausted => {
                    info!(investigation = %self.record.id, phase = %self.record.phase, "phase exhausted without meeting its exit predicate");
                    TransitionKind::Partial
                }
                PhaseVerdict::Expired => {
                    info!(investigation = %self.record.id, phase = %self.record.phase, "phase dwell expired");
                    self.close_phase("phase dwell expired").await;
                    TransitionKind::Partial
                }
            };

            if let Err(err) = self.advance(kind).await {
                self.escalate(err).await;
                return;
            }
        }
    }

    async fn advance(&mut self, kind: TransitionKind) -> Result<()> {
        let current = self.record.phase;
        if kind == TransitionKind::Partial && !self.record.degraded_phases.contains(&current) {
            self.record.degraded_phases.push(current);
        }
        match current.next() {
            Some(next) => self.open_phase(next, kind).await,
            None => self.complete().await,
        }
    }

    async fn open_phase(&mut self, phase: Phase, kind: TransitionKind) -> Result<()> {
        let transition = self.record.enter_phase(phase, kind)?;
        self.phase_token = self.investigation_token.child_token();
        self.deferred.clear();
        if self.record.status == InvestigationStatus::Planning && phase != Phase::Planning {
            self.record.status = InvestigationStatus::Active;
        }
        if phase == Phase::Collection {
            activate_targets(&mut self.record);
        }

        info!(
            investigation = %self.record.id,
            phase = %phase,
            sequence = transition.sequence,
            kind = ?kind,
            "phase entered"
        );
        let summary = format!("{phase} entered ({kind:?}), transition {}", transition.sequence);
        self.emit(EventType::PhaseEntered, summary).await;

        let planned = self
            .deps
            .policy
            .plan_entry(&self.record, self.deps.dispatcher.registry(), phase);
        let groups = match self.deps.config.phases.sequencing {
            Sequencing::Concurrent if planned.is_empty() => Vec::new(),
            Sequencing::Concurrent => vec![planned],
            Sequencing::ByCapability => capability_groups(planned),
        };

        let mut created = VecDeque::with_capacity(groups.len());
        for group in groups {
            let ids: Vec<TaskID> = group.into_iter().map(|p| self.create_task(p)).collect();
            created.push_back(ids);
        }

        if phase == Phase::Collection {
            for (target_id, status) in self.deps.aggregator.refresh_targets(&mut self.record) {
                let text = format!("{} {status}", self.target_label(Some(target_id)));
                self.emit(EventType::TargetSettled, text).await;
            }
        }
        scoring::rescore(&mut self.record)?;

        if let Some(first) = created.pop_front() {
            for task_id in first {
                self.submit(task_id).await?;
            }
        }
        self.deferred = created;
        self.persist().await
    }

    fn create_task(&mut self, planned: PlannedTask) -> TaskID {
        let task = AgentTask {
            id: TaskID::new(),
            investigation_id: self.record.id,
            target: planned.target,
            capability: planned.capability,
            phase: self.record.phase,
            epoch: self.record.phase_epoch,
            priority: planned.priority,
            status: TaskStatus::Pending,
            attempts: 0,
            payload: planned.payload,
            produced: Vec::new(),
            error: None,
            annotations: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        };
        let id = task.id;
        self.record.tasks.insert(id, task);
        id
    }

    /// Hands a task to the dispatcher. A rejected submission fails the task.
    async fn submit(&mut self, task_id: TaskID) -> Result<()> {
        let Some(task) = self.record.tasks.get(&task_id) else {
            return Ok(());
        };
        let request = DispatchRequest {
            task_id,
            investigation_id: self.record.id,
            capability: task.capability.clone(),
            priority: task.priority,
            payload: task.payload.clone(),
            cancel: self.phase_token.clone(),
        };
        let summary = format!("{} queued for {}", task.capability, self.target_label(task.target));

        match self.deps.dispatcher.submit(request, self.notices_tx.clone()).await {
            Ok(()) => {
                self.emit(EventType::TaskQueued, summary).await;
                Ok(())
            }
            Err(err) => {
                warn!(investigation = %self.record.id, task = %task_id, error = %err, "task rejected by dispatcher");
                let report = TaskReport {
                    task_id,
                    investigation_id: self.record.id,
                    attempts: 0,
                    disposition: Disposition::Failed(WorkerError::new(err.to_string())),
                };
                self.apply(report).await
            }
        }
    }

    /// Submits the next capability group once the previous one settled.
    async fn release_next_group(&mut self) -> Result<()> {
        if self.deferred.is_empty() {
            return Ok(());
        }
        let waiting: HashSet<TaskID> = self.deferred.iter().flatten().copied().collect();
        let busy = self
            .record
            .current_phase_tasks()
            .any(|t| !t.status.is_terminal() && !waiting.contains(&t.id));
        if busy {
            return Ok(());
        }
        if let Some(group) = self.deferred.pop_front() {
            for task_id in group {
                self.submit(task_id).await?;
            }
        }
        Ok(())
    }

    async fn complete(&mut self) -> Result<()> {
        scoring::rescore(&mut self.record)?;
        self.record.status = InvestigationStatus::Completed;
        self.record.touch();
        self.deps.dispatcher.forget(&self.record.id);

        info!(
            investigation = %self.record.id,
            confidence = self.record.confidence,
            completeness = self.record.completeness,
            degraded = ?self.record.degraded_phases,
            "investigation completed"
        );
        let summary = format!(
            "completed with confidence {:.3}, completeness {:.3}",
            self.record.confidence, self.record.completeness
        );
        self.emit(EventType::InvestigationCompleted, summary).await;
        self.persist().await
    }

    /// Cancels the open phase's outstanding work. In-flight attempts report
    /// back through the notice channel.
    async fn close_phase(&mut self, reason: &str) {
        self.phase_token.cancel();
        self.cancel_outstanding(reason).await;
    }

    /// Reports purged queue entries and unsubmitted groups as CANCELLED.
    async fn cancel_outstanding(&mut self, reason: &str) {
        let mut reports = self.deps.dispatcher.purge_cancelled(self.record.id).await;
        let deferred: Vec<TaskID> = self.deferred.drain(..).flatten().collect();
        reports.extend(
            deferred
                .into_iter()
                .filter_map(|task_id| self.cancelled_report(task_id, reason)),
        );

        for report in reports {
            if let Err(err) = self.apply(report).await {
                warn!(investigation = %self.record.id, error = %err, "cancelled task could not be recorded");
            }
        }
    }

    fn cancelled_report(&self, task_id: TaskID, reason: &str) -> Option<TaskReport> {
        let task = self.record.tasks.get(&task_id)?;
        if task.status.is_terminal() {
            return None;
        }
        Some(TaskReport {
            task_id,
            investigation_id: self.record.id,
            attempts: task.attempts,
            disposition: Disposition::Cancelled(reason.to_string()),
        })
    }

    async fn pause(&mut self) -> Result<()> {
        let status = self.record.status;
        if status == InvestigationStatus::Paused {
            return Ok(());
        }
        if status.is_terminal() {
            return Err(InvestigationError::InvalidTransition(format!(
                "cannot pause a {status} investigation"
            )));
        }

        self.status_before_pause = status;
        self.record.status = InvestigationStatus::Paused;
        self.paused_at = Some(Utc::now());
        self.record.touch();
        self.deps.dispatcher.pause(self.record.id);

        info!(investigation = %self.record.id, phase = %self.record.phase, "investigation paused");
        let summary = format!("paused in {}", self.record.phase);
        self.emit(EventType::InvestigationPaused, summary).await;
        self.persist_or_fail().await
    }

    async fn resume(&mut self) -> Result<()> {
        if self.record.status != InvestigationStatus::Paused {
            return Err(InvestigationError::InvalidTransition(format!(
                "cannot resume a {} investigation",
                self.record.status
            )));
        }

        let now = Utc::now();
        // dwell does not run while paused
        if let Some(paused_at) = self.paused_at.take() {
            self.record.phase_entered_at += now - paused_at;
        }
        self.record.status = self.status_before_pause;
        self.record.touch();
        self.deps.dispatcher.resume(self.record.id).await;

        info!(investigation = %self.record.id, phase = %self.record.phase, "investigation resumed");
        let summary = format!("resumed in {}", self.record.phase);
        self.emit(EventType::InvestigationResumed, summary).await;
        self.persist_or_fail().await
    }

    async fn cancel(&mut self, reason: String, reply: oneshot::Sender<Result<InvestigationSnapshot>>) {
        match self.record.status {
            InvestigationStatus::Completed | InvestigationStatus::Archived => {
                let _ = reply.send(Err(InvestigationError::InvalidTransition(format!(
                    "cannot cancel a {} investigation",
                    self.record.status
                ))));
                return;
            }
            InvestigationStatus::Failed => {}
            _ => self.fail(reason).await,
        }
        self.cancel_waiters.push(reply);
        self.answer_cancel_waiters();
    }

    async fn cancel_phase(&mut self) -> Result<()> {
        if self.record.status.is_terminal() {
            return Err(InvestigationError::InvalidTransition(format!(
                "cannot cancel a phase of a {} investigation",
                self.record.status
            )));
        }
        info!(investigation = %self.record.id, phase = %self.record.phase, "phase cancelled by operator");
        self.close_phase("phase cancelled by operator").await;
        self.persist_or_fail().await
    }

    async fn reopen(&mut self, phase: Phase) -> Result<()> {
        let status = self.record.status;
        if !status.allows_reopen() {
            return Err(InvestigationError::InvalidTransition(format!(
                "cannot reopen a phase of a {status} investigation"
            )));
        }
        if phase >= self.record.phase {
            return Err(InvestigationError::InvalidTransition(format!(
                "cannot reopen {phase} from {}",
                self.record.phase
            )));
        }

        self.close_phase("phase reopened").await;
        let result = self.open_phase(phase, TransitionKind::Reopened).await;
        if let Err(err) = &result
            && err.escalates()
        {
            self.fail(err.to_string()).await;
        }
        result
    }

    async fn archive(&mut self) -> Result<()> {
        if self.record.status != InvestigationStatus::Completed {
            return Err(InvestigationError::InvalidTransition(format!(
                "only completed investigations can be archived, this one is {}",
                self.record.status
            )));
        }
        self.record.status = InvestigationStatus::Archived;
        self.record.touch();
        self.emit(EventType::InvestigationArchived, "archived").await;
        self.persist_or_fail().await?;

        self.deps.broadcaster.close(self.record.id);
        self.stopped = true;
        Ok(())
    }

    /// Moves the investigation to FAILED and cancels all outstanding work.
    async fn fail(&mut self, reason: String) {
        if matches!(
            self.record.status,
            InvestigationStatus::Failed | InvestigationStatus::Archived
        ) {
            return;
        }
        error!(investigation = %self.record.id, phase = %self.record.phase, reason = %reason, "investigation failed");

        self.record.status = InvestigationStatus::Failed;
        self.record.failure_reason = Some(reason.clone());
        self.record.touch();
        self.investigation_token.cancel();
        self.cancel_outstanding("investigation failed").await;
        self.deps.dispatcher.forget(&self.record.id);

        self.emit(EventType::InvestigationFailed, reason).await;
        if let Err(err) = self.persist().await {
            error!(investigation = %self.record.id, error = %err, "failed investigation could not be saved");
        }
        self.answer_cancel_waiters();
    }

    async fn escalate(&mut self, err: InvestigationError) {
        if err.escalates() {
            self.fail(err.to_string()).await;
        } else {
            warn!(investigation = %self.record.id, error = %err, "investigation step failed");
        }
    }

    fn answer_cancel_waiters(&mut self) {
        if self.cancel_waiters.is_empty() || self.record.has_live_tasks() {
            return;
        }
        let snapshot = self.record.snapshot();
        for waiter in self.cancel_waiters.drain(..) {
            let _ = waiter.send(Ok(snapshot.clone()));
        }
    }

    async fn on_shutdown(&mut self) {
        info!(investigation = %self.record.id, status = %self.record.status, "investigation actor shutting down");
        self.investigation_token.cancel();
        if let Err(err) = self.persist().await {
            error!(investigation = %self.record.id, error = %err, "final save failed");
        }
        for waiter in self.cancel_waiters.drain(..) {
            let _ = waiter.send(Err(InvestigationError::Cancelled("service shutting down".into())));
        }
    }

    /// Saves with bounded retries. Exhaustion is a persistence error.
    async fn persist(&mut self) -> Result<()> {
        let attempts = self.deps.config.runtime.save_attempts.max(1);
        let delay = Duration::from_millis(self.deps.config.runtime.save_retry_delay_ms);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.deps.store.save(&self.record).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        investigation = %self.record.id,
                        attempt,
                        error = %err,
                        "saving investigation failed"
                    );
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let reason = last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string());
        Err(InvestigationError::Persistence(format!(
            "giving up after {attempts} save attempt(s): {reason}"
        )))
    }

    async fn persist_or_fail(&mut self) -> Result<()> {
        match self.persist().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail(err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn emit(&self, event_type: EventType, summary: impl Into<String>) {
        if let Err(err) = self
            .deps
            .broadcaster
            .publish(self.record.id, event_type, summary)
            .await
        {
            warn!(investigation = %self.record.id, error = %err, "progress event not published");
        }
    }

    fn target_label(&self, target: Option<TargetID>) -> String {
        target
            .and_then(|id| self.record.targets.get(&id))
            .map_or_else(|| "investigation".to_string(), |t| t.label.clone())
    }
}

fn running_status(phase: Phase) -> InvestigationStatus {
    if phase == Phase::Planning {
        InvestigationStatus::Planning
    } else {
        InvestigationStatus::Active
    }
}
