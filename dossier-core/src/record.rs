//! The investigation record: root aggregate and everything it owns.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use dossier_model::{
    AssessmentID, Classification, EvidenceID, InvestigationID,
    InvestigationStatus, Phase, Priority, ResultID, TargetID, TargetKind,
    TargetStatus, TaskID, TaskStatus, ThreatLevel,
};
use serde::{Deserialize, Serialize};

use crate::error::{InvestigationError, Result};
use crate::registry::Capability;
use crate::spec::InvestigationSpec;
use crate::worker::{EvidenceView, FindingView, TargetBrief, TaskPayload};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvestigationRecord {
    pub id: InvestigationID,
    pub title: String,
    pub objective: String,
    pub classification: Classification,
    pub priority: Priority,
    pub status: InvestigationStatus,
    pub phase: Phase,
    /// Bumped every time a phase is entered, including re-opens.
    pub phase_epoch: u32,
    pub phase_entered_at: DateTime<Utc>,
    pub phase_history: Vec<PhaseTransition>,
    pub plan: PhasePlan,
    pub targets: BTreeMap<TargetID, Target>,
    pub tasks: BTreeMap<TaskID, AgentTask>,
    /// Append-only, ordered by `sequence`.
    pub evidence: Vec<Evidence>,
    pub findings: Vec<AnalysisResult>,
    pub assessments: Vec<ThreatAssessment>,
    /// Tasks whose terminal outcome has been applied.
    pub ingested: BTreeSet<TaskID>,
    pub next_evidence_seq: u64,
    pub confidence: f64,
    pub completeness: f64,
    pub degraded_phases: Vec<Phase>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Capabilities the investigation runs outside of per-target collection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePlan {
    pub planning: Vec<Capability>,
    pub analysis: Vec<Capability>,
    pub synthesis: Vec<Capability>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Investigation started in its first phase.
    Opened,
    /// Previous phase met its exit predicate.
    Satisfied,
    /// Previous phase closed on dwell expiry or exhaustion.
    Partial,
    /// Operator returned to an earlier phase.
    Reopened,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub sequence: u64,
    pub from: Option<Phase>,
    pub to: Phase,
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetID,
    pub investigation_id: InvestigationID,
    pub label: String,
    pub kind: TargetKind,
    pub priority: Priority,
    pub requirements: Vec<Capability>,
    pub status: TargetStatus,
}

impl Target {
    pub fn brief(&self) -> TargetBrief {
        TargetBrief {
            id: self.id,
            label: self.label.clone(),
            kind: self.kind,
        }
    }
}

/// Reference from a task to what it produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ProductRef {
    Evidence(EvidenceID),
    Finding(ResultID),
    Assessment(AssessmentID),
    Requirement(Capability),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: TaskID,
    pub investigation_id: InvestigationID,
    pub target: Option<TargetID>,
    pub capability: Capability,
    pub phase: Phase,
    pub epoch: u32,
    pub priority: Priority,
    pub status: TaskStatus,
    pub attempts: u32,
    pub payload: TaskPayload,
    pub produced: Vec<ProductRef>,
    pub error: Option<String>,
    /// Free-form audit notes. The only field writable after termination.
    pub annotations: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentTask {
    /// Moves the task to `next`. A terminal task never changes again.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(InvestigationError::ConsistencyViolation(format!(
                "task {} is already {} and cannot become {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn annotate(&mut self, note: impl Into<String>) {
        self.annotations.push(note.into());
    }

    /// Records produced by this task that count toward phase thresholds.
    pub fn product_count(&self) -> usize {
        self.produced
            .iter()
            .filter(|p| !matches!(p, ProductRef::Requirement(_)))
            .count()
    }
}

/// Immutable fact produced by a completed task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub id: EvidenceID,
    /// Ingestion order within the investigation, starting at 1.
    pub sequence: u64,
    pub investigation_id: InvestigationID,
    pub target: TargetID,
    pub task: TaskID,
    pub capability: Capability,
    pub source_id: String,
    pub source_type: String,
    pub content: String,
    /// 0-100
    pub reliability: u8,
    /// 0-100
    pub relevance: u8,
    /// Metadata only. Never used for ordering.
    pub collected_at: DateTime<Utc>,
    pub verified: bool,
    pub supersedes: Option<EvidenceID>,
}

impl Evidence {
    pub fn view(&self) -> EvidenceView {
        EvidenceView {
            id: self.id,
            source_id: self.source_id.clone(),
            source_type: self.source_type.clone(),
            content: self.content.clone(),
            reliability: self.reliability,
            relevance: self.relevance,
            verified: self.verified,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: ResultID,
    pub task: TaskID,
    pub target: Option<TargetID>,
    pub capability: Capability,
    pub summary: String,
    pub cites: Vec<EvidenceID>,
    /// Derived from `cites`, see [`crate::scoring::derived_confidence`].
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn view(&self) -> FindingView {
        FindingView {
            id: self.id,
            target: self.target,
            summary: self.summary.clone(),
            cites: self.cites.clone(),
            confidence: self.confidence,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreatAssessment {
    pub id: AssessmentID,
    pub task: TaskID,
    pub capability: Capability,
    pub level: ThreatLevel,
    pub summary: String,
    pub cites: Vec<EvidenceID>,
    pub findings: Vec<ResultID>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl InvestigationRecord {
    /// Fresh record in PLANNING. No phase has been entered yet.
    pub fn from_spec(id: InvestigationID, spec: &InvestigationSpec) -> Self {
        let now = Utc::now();
        let targets = spec
            .targets
            .iter()
            .map(|t| {
                let target = Target {
                    id: TargetID::new(),
                    investigation_id: id,
                    label: t.label.clone(),
                    kind: t.kind,
                    priority: t.priority.unwrap_or(spec.priority),
                    requirements: dedup(&t.requirements),
                    status: TargetStatus::Pending,
                };
                (target.id, target)
            })
            .collect();

        Self {
            id,
            title: spec.title.clone(),
            objective: spec.objective.clone(),
            classification: spec.classification,
            priority: spec.priority,
            status: InvestigationStatus::Planning,
            phase: Phase::Planning,
            phase_epoch: 0,
            phase_entered_at: now,
            phase_history: Vec::new(),
            plan: PhasePlan {
                planning: dedup(&spec.planning),
                analysis: dedup(&spec.analysis),
                synthesis: dedup(&spec.synthesis),
            },
            targets,
            tasks: BTreeMap::new(),
            evidence: Vec::new(),
            findings: Vec::new(),
            assessments: Vec::new(),
            ingested: BTreeSet::new(),
            next_evidence_seq: 1,
            confidence: 0.0,
            completeness: 0.0,
            degraded_phases: Vec::new(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Appends a transition and moves into `to`. Forward moves must go to
    /// the immediate successor; only `Reopened` may move backwards.
    pub fn enter_phase(&mut self, to: Phase, kind: TransitionKind) -> Result<PhaseTransition> {
        let from = self.phase_history.last().map(|t| t.to);
        match (from, kind) {
            (None, TransitionKind::Opened) => {}
            (Some(current), TransitionKind::Satisfied | TransitionKind::Partial)
                if current.next() == Some(to) => {}
            (Some(current), TransitionKind::Reopened) if to < current => {}
            _ => {
                return Err(InvestigationError::InvalidTransition(format!(
                    "{} cannot move from {:?} to {to}",
                    kind_label(kind),
                    from
                )));
            }
        }

        let now = Utc::now();
        let sequence = self.phase_history.last().map_or(1, |t| t.sequence + 1);
        self.phase = to;
        self.phase_epoch += 1;
        self.phase_entered_at = now;
        self.updated_at = now;
        let transition = PhaseTransition {
            sequence,
            from,
            to,
            kind,
            at: now,
        };
        self.phase_history.push(transition.clone());
        Ok(transition)
    }

    /// Tasks belonging to the phase instance currently open.
    pub fn current_phase_tasks(&self) -> impl Iterator<Item = &AgentTask> {
        let (phase, epoch) = (self.phase, self.phase_epoch);
        self.tasks
            .values()
            .filter(move |t| t.phase == phase && t.epoch == epoch)
    }

    pub fn evidence_by_id(&self, id: &EvidenceID) -> Option<&Evidence> {
        self.evidence.iter().find(|e| &e.id == id)
    }

    pub fn finding_by_id(&self, id: &ResultID) -> Option<&AnalysisResult> {
        self.findings.iter().find(|f| &f.id == id)
    }

    /// Evidence that no later item supersedes, in sequence order.
    pub fn head_evidence(&self) -> Vec<&Evidence> {
        let superseded: BTreeSet<EvidenceID> =
            self.evidence.iter().filter_map(|e| e.supersedes).collect();
        self.evidence
            .iter()
            .filter(|e| !superseded.contains(&e.id))
            .collect()
    }

    /// True once some head evidence for `target` came from `capability`.
    /// Superseded items no longer count.
    pub fn requirement_satisfied(&self, target: TargetID, capability: &Capability) -> bool {
        self.head_evidence()
            .into_iter()
            .any(|e| e.target == target && &e.capability == capability)
    }

    pub fn has_live_tasks(&self) -> bool {
        self.tasks.values().any(|t| !t.status.is_terminal())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> InvestigationSnapshot {
        let mut counts = TaskCounts::default();
        for task in self.tasks.values() {
            counts.record(task.status);
        }

        let targets = self
            .targets
            .values()
            .map(|t| TargetSnapshot {
                id: t.id,
                label: t.label.clone(),
                kind: t.kind,
                status: t.status,
                requirements: t.requirements.clone(),
                satisfied: t
                    .requirements
                    .iter()
                    .filter(|cap| self.requirement_satisfied(t.id, cap))
                    .cloned()
                    .collect(),
            })
            .collect();

        let tasks = self
            .tasks
            .values()
            .map(|t| TaskSummary {
                id: t.id,
                capability: t.capability.clone(),
                target: t.target,
                phase: t.phase,
                status: t.status,
                attempts: t.attempts,
                error: t.error.clone(),
            })
            .collect();

        InvestigationSnapshot {
            id: self.id,
            title: self.title.clone(),
            classification: self.classification,
            priority: self.priority,
            status: self.status,
            phase: self.phase,
            phase_history: self.phase_history.clone(),
            confidence: self.confidence,
            completeness: self.completeness,
            degraded_phases: self.degraded_phases.clone(),
            failure_reason: self.failure_reason.clone(),
            targets,
            task_counts: counts,
            tasks,
            evidence_count: self.evidence.len(),
            finding_count: self.findings.len(),
            assessments: self.assessments.clone(),
            updated_at: self.updated_at,
        }
    }
}

fn kind_label(kind: TransitionKind) -> &'static str {
    match kind {
        TransitionKind::Opened => "open",
        TransitionKind::Satisfied => "advance",
        TransitionKind::Partial => "partial advance",
        TransitionKind::Reopened => "reopen",
    }
}

fn dedup(caps: &[Capability]) -> Vec<Capability> {
    let mut seen = BTreeSet::new();
    caps.iter()
        .filter(|c| seen.insert((*c).clone()))
        .cloned()
        .collect()
}

/// Read-only view returned by `get_status`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvestigationSnapshot {
    pub id: InvestigationID,
    pub title: String,
    pub classification: Classification,
    pub priority: Priority,
    pub status: InvestigationStatus,
    pub phase: Phase,
    pub phase_history: Vec<PhaseTransition>,
    pub confidence: f64,
    /// Satisfied collection requirements over all requirements.
    pub completeness: f64,
    pub degraded_phases: Vec<Phase>,
    pub failure_reason: Option<String>,
    pub targets: Vec<TargetSnapshot>,
    pub task_counts: TaskCounts,
    pub tasks: Vec<TaskSummary>,
    pub evidence_count: usize,
    pub finding_count: usize,
    pub assessments: Vec<ThreatAssessment>,
    pub updated_at: DateTime<Utc>,
}

impl InvestigationSnapshot {
    pub fn target_by_label(&self, label: &str) -> Option<&TargetSnapshot> {
        self.targets.iter().find(|t| t.label == label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSnapshot {
    pub id: TargetID,
    pub label: String,
    pub kind: TargetKind,
    pub status: TargetStatus,
    pub requirements: Vec<Capability>,
    pub satisfied: Vec<Capability>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskID,
    pub capability: Capability,
    pub target: Option<TargetID>,
    pub phase: Phase,
    pub status: TaskStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl TaskCounts {
    fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::TimedOut => self.timed_out += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn live(&self) -> usize {
        self.pending + self.in_progress
    }
}
