//! Worker contract and the tagged payload/product types that cross it.

mod builtin;

pub use builtin::{
    AssessmentSynthesizer, CorroborationAnalyzer, FixtureResponse,
    FixtureWorker,
};

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dossier_model::{
    EvidenceID, InvestigationID, ResultID, TargetID, TargetKind, TaskID,
    ThreatLevel,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::registry::{Capability, CapabilityKind};

/// Executes one attempt of a task for a capability.
///
/// Implementations should observe `ctx.cancel` and return promptly once it
/// fires. Work that already produced a result may still return `Success`.
#[async_trait]
pub trait Worker: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        capability: &Capability,
        payload: &TaskPayload,
        ctx: &WorkContext,
    ) -> Outcome;
}

/// Per-attempt execution context handed to workers.
#[derive(Clone, Debug)]
pub struct WorkContext {
    pub investigation_id: InvestigationID,
    pub task_id: TaskID,
    /// 1-based attempt number.
    pub attempt: u32,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

/// Typed result of a single dispatch.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Success(WorkProduct),
    Retryable(WorkerError),
    Fatal(WorkerError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Outcome::Retryable(WorkerError::new(message))
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Outcome::Fatal(WorkerError::new(message))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerError {
    pub message: String,
    /// Set when the attempt hit its capability timeout.
    #[serde(default)]
    pub timed_out: bool,
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(after_ms: u128) -> Self {
        Self {
            message: format!("attempt exceeded {after_ms}ms timeout"),
            timed_out: true,
        }
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Minimal view of a target that workers are allowed to see.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetBrief {
    pub id: TargetID,
    pub label: String,
    pub kind: TargetKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvidenceView {
    pub id: EvidenceID,
    pub source_id: String,
    pub source_type: String,
    pub content: String,
    pub reliability: u8,
    pub relevance: u8,
    pub verified: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FindingView {
    pub id: ResultID,
    pub target: Option<TargetID>,
    pub summary: String,
    pub cites: Vec<EvidenceID>,
    pub confidence: f64,
}

/// Input to a worker, one variant per capability kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    Plan {
        objective: String,
        targets: Vec<TargetBrief>,
    },
    Collect {
        target: TargetBrief,
    },
    Analyze {
        target: TargetBrief,
        evidence: Vec<EvidenceView>,
    },
    Synthesize {
        objective: String,
        findings: Vec<FindingView>,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            TaskPayload::Plan { .. } => CapabilityKind::Planning,
            TaskPayload::Collect { .. } => CapabilityKind::Collection,
            TaskPayload::Analyze { .. } => CapabilityKind::Analysis,
            TaskPayload::Synthesize { .. } => CapabilityKind::Synthesis,
        }
    }

    pub fn target(&self) -> Option<&TargetBrief> {
        match self {
            TaskPayload::Collect { target } | TaskPayload::Analyze { target, .. } => {
                Some(target)
            }
            _ => None,
        }
    }

    /// Shape checks that do not depend on the registry.
    pub fn check_shape(&self) -> std::result::Result<(), String> {
        match self {
            TaskPayload::Plan { objective, .. } | TaskPayload::Synthesize { objective, .. }
                if objective.trim().is_empty() =>
            {
                Err("objective is empty".into())
            }
            TaskPayload::Collect { target } if target.label.trim().is_empty() => {
                Err("target label is empty".into())
            }
            TaskPayload::Analyze { evidence, .. } if evidence.is_empty() => {
                Err("analysis requires at least one evidence item".into())
            }
            _ => Ok(()),
        }
    }
}

/// Output of a successful attempt, one variant per capability kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkProduct {
    Plan { suggestions: Vec<RequirementSuggestion> },
    Evidence { items: Vec<EvidenceDraft> },
    Findings { items: Vec<FindingDraft> },
    Assessment { draft: AssessmentDraft },
}

impl WorkProduct {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            WorkProduct::Plan { .. } => CapabilityKind::Planning,
            WorkProduct::Evidence { .. } => CapabilityKind::Collection,
            WorkProduct::Findings { .. } => CapabilityKind::Analysis,
            WorkProduct::Assessment { .. } => CapabilityKind::Synthesis,
        }
    }
}

/// Extra collection requirement proposed by a planning worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementSuggestion {
    pub target: TargetID,
    pub capability: Capability,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvidenceDraft {
    pub source_id: String,
    pub source_type: String,
    pub content: String,
    pub reliability: u8,
    pub relevance: u8,
    #[serde(default)]
    pub collected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub verified: bool,
    /// Earlier evidence this item corrects.
    #[serde(default)]
    pub supersedes: Option<EvidenceID>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FindingDraft {
    pub summary: String,
    pub cites: Vec<EvidenceID>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssessmentDraft {
    pub level: ThreatLevel,
    pub summary: String,
    pub cites: Vec<EvidenceID>,
    #[serde(default)]
    pub findings: Vec<ResultID>,
}
