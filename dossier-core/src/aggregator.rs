use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use dossier_model::{
    AssessmentID, EvidenceID, ResultID, TargetID, TargetStatus, TaskID,
    TaskStatus,
};
use tracing::{debug, info, warn};

use crate::dispatch::{Disposition, TaskReport};
use crate::error::{InvestigationError, Result};
use crate::record::{
    AnalysisResult, Evidence, InvestigationRecord, ProductRef, ThreatAssessment,
};
use crate::registry::{Capability, CapabilityKind, CapabilityRegistry};
use crate::scoring;
use crate::worker::{
    AssessmentDraft, EvidenceDraft, FindingDraft, RequirementSuggestion,
    WorkProduct,
};

/// Applies terminal task reports to the record. Only the owning
/// investigation actor calls into this, which makes it the single writer
/// of evidence and derived records.
#[derive(Clone)]
pub struct EvidenceAggregator {
    registry: Arc<CapabilityRegistry>,
}

impl fmt::Debug for EvidenceAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvidenceAggregator")
            .field("capabilities", &self.registry.capabilities().len())
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum IngestOutcome {
    /// The task's terminal outcome was already applied.
    Duplicate,
    Applied(IngestSummary),
}

#[derive(Clone, Debug, PartialEq)]
pub struct IngestSummary {
    pub task_id: TaskID,
    pub capability: Capability,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub evidence: Vec<EvidenceID>,
    pub findings: Vec<ResultID>,
    pub assessments: Vec<AssessmentID>,
    pub requirements: Vec<(TargetID, Capability)>,
    pub targets: Vec<(TargetID, TargetStatus)>,
    pub confidence: f64,
    pub completeness: f64,
}

impl EvidenceAggregator {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    /// Applies a task's terminal report. Idempotent by task id.
    pub fn ingest(&self, record: &mut InvestigationRecord, report: TaskReport) -> Result<IngestOutcome> {
        if report.investigation_id != record.id {
            return Err(InvestigationError::ConsistencyViolation(format!(
                "report for task {} belongs to investigation {}, not {}",
                report.task_id, report.investigation_id, record.id
            )));
        }
        if record.ingested.contains(&report.task_id) {
            debug!(task = %report.task_id, "duplicate terminal report ignored");
            return Ok(IngestOutcome::Duplicate);
        }

        let (capability, target) = self.check_task(record, report.task_id)?;

        let mut applied = Applied::default();
        let (status, error) = match report.disposition {
            Disposition::Completed(product) => {
                match self.apply_product(record, report.task_id, &capability, target, product) {
                    Ok(done) => {
                        applied = done;
                        (TaskStatus::Completed, None)
                    }
                    Err(InvestigationError::FatalWorker(reason)) => {
                        warn!(
                            investigation = %record.id,
                            task = %report.task_id,
                            capability = %capability,
                            error = %reason,
                            "worker product rejected"
                        );
                        (TaskStatus::Failed, Some(reason))
                    }
                    Err(other) => return Err(other),
                }
            }
            other => (other.status(), other.error_message()),
        };

        let task = record
            .tasks
            .get_mut(&report.task_id)
            .ok_or_else(|| InvestigationError::ConsistencyViolation(format!("task {} vanished", report.task_id)))?;
        task.transition(status)?;
        task.attempts = task.attempts.max(report.attempts);
        task.error = error.clone();
        task.produced.extend(applied.refs());
        record.ingested.insert(report.task_id);

        let targets = self.refresh_targets(record);
        scoring::rescore(record)?;
        record.touch();

        debug!(
            investigation = %record.id,
            task = %report.task_id,
            status = %status,
            evidence = applied.evidence.len(),
            confidence = record.confidence,
            "task outcome ingested"
        );

        Ok(IngestOutcome::Applied(IngestSummary {
            task_id: report.task_id,
            capability,
            status,
            error,
            evidence: applied.evidence,
            findings: applied.findings,
            assessments: applied.assessments,
            requirements: applied.requirements,
            targets,
            confidence: record.confidence,
            completeness: record.completeness,
        }))
    }

    /// Settles ACTIVE targets: COMPLETED once every requirement has
    /// evidence, FAILED once no collection work for it remains and a
    /// requirement is still unmet. Returns the targets that changed.
    pub fn refresh_targets(&self, record: &mut InvestigationRecord) -> Vec<(TargetID, TargetStatus)> {
        let mut changes = Vec::new();
        let ids: Vec<TargetID> = record
            .targets
            .values()
            .filter(|t| t.status == TargetStatus::Active)
            .map(|t| t.id)
            .collect();

        for id in ids {
            let Some(target) = record.targets.get(&id) else {
                continue;
            };
            let all_met = target
                .requirements
                .iter()
                .all(|cap| record.requirement_satisfied(id, cap));
            let live = record.tasks.values().any(|t| {
                t.target == Some(id)
                    && target.requirements.contains(&t.capability)
                    && !t.status.is_terminal()
            });

            let next = if all_met {
                TargetStatus::Completed
            } else if !live {
                TargetStatus::Failed
            } else {
                continue;
            };

            if let Some(target) = record.targets.get_mut(&id) {
                target.status = next;
                info!(investigation = %record.id, target = %target.label, status = %next, "target settled");
                changes.push((id, next));
            }
        }
        changes
    }

    fn check_task(&self, record: &InvestigationRecord, task_id: TaskID) -> Result<(Capability, Option<TargetID>)> {
        let task = record.tasks.get(&task_id).ok_or_else(|| {
            InvestigationError::ConsistencyViolation(format!(
                "report for unknown task {task_id}"
            ))
        })?;
        if task.investigation_id != record.id {
            return Err(InvestigationError::ConsistencyViolation(format!(
                "task {task_id} belongs to investigation {}",
                task.investigation_id
            )));
        }
        if task.status.is_terminal() {
            return Err(InvestigationError::ConsistencyViolation(format!(
                "task {task_id} is already {} but its report was never ingested",
                task.status
            )));
        }
        if let Some(target_id) = task.target {
            match record.targets.get(&target_id) {
                Some(target) if target.investigation_id == record.id => {}
                _ => {
                    return Err(InvestigationError::ConsistencyViolation(format!(
                        "task {task_id} references target {target_id} outside investigation {}",
                        record.id
                    )));
                }
            }
        }
        Ok((task.capability.clone(), task.target))
    }

    fn apply_product(
        &self,
        record: &mut InvestigationRecord,
        task_id: TaskID,
        capability: &Capability,
        target: Option<TargetID>,
        product: WorkProduct,
    ) -> Result<Applied> {
        match product {
            WorkProduct::Plan { suggestions } => self.apply_plan(record, suggestions),
            WorkProduct::Evidence { items } => {
                let target = target.ok_or_else(|| {
                    InvestigationError::FatalWorker(format!(
                        "{capability} produced evidence without a target"
                    ))
                })?;
                apply_evidence(record, task_id, capability, target, items)
            }
            WorkProduct::Findings { items } => apply_findings(record, task_id, capability, target, items),
            WorkProduct::Assessment { draft } => apply_assessment(record, task_id, capability, draft),
        }
    }

    fn apply_plan(&self, record: &mut InvestigationRecord, suggestions: Vec<RequirementSuggestion>) -> Result<Applied> {
        for s in &suggestions {
            if !record.targets.contains_key(&s.target) {
                return Err(InvestigationError::FatalWorker(format!(
                    "suggestion names unknown target {}",
                    s.target
                )));
            }
            match self.registry.descriptor(&s.capability) {
                Ok(d) if d.kind == CapabilityKind::Collection => {}
                Ok(d) => {
                    return Err(InvestigationError::FatalWorker(format!(
                        "suggested capability {} is a {} capability",
                        s.capability, d.kind
                    )));
                }
                Err(_) => {
                    return Err(InvestigationError::FatalWorker(format!(
                        "suggested capability {} is not registered",
                        s.capability
                    )));
                }
            }
        }

        let mut applied = Applied::default();
        for s in suggestions {
            if let Some(target) = record.targets.get_mut(&s.target)
                && !target.requirements.contains(&s.capability)
            {
                target.requirements.push(s.capability.clone());
                applied.requirements.push((s.target, s.capability));
            }
        }
        Ok(applied)
    }
}

fn apply_evidence(
    record: &mut InvestigationRecord,
    task_id: TaskID,
    capability: &Capability,
    target: TargetID,
    items: Vec<EvidenceDraft>,
) -> Result<Applied> {
    for draft in &items {
        if draft.reliability > 100 || draft.relevance > 100 {
            return Err(InvestigationError::FatalWorker(format!(
                "evidence {} scores out of range ({} / {})",
                draft.source_id, draft.reliability, draft.relevance
            )));
        }
        if let Some(old) = draft.supersedes {
            match record.evidence_by_id(&old) {
                Some(prior) if prior.target == target => {}
                Some(_) => {
                    return Err(InvestigationError::FatalWorker(format!(
                        "evidence {} supersedes {old} of another target",
                        draft.source_id
                    )));
                }
                None => {
                    return Err(InvestigationError::FatalWorker(format!(
                        "evidence {} supersedes unknown evidence {old}",
                        draft.source_id
                    )));
                }
            }
        }
    }

    let now = Utc::now();
    let mut applied = Applied::default();
    for draft in items {
        let evidence = Evidence {
            id: EvidenceID::new(),
            sequence: record.next_evidence_seq,
            investigation_id: record.id,
            target,
            task: task_id,
            capability: capability.clone(),
            source_id: draft.source_id,
            source_type: draft.source_type,
            content: draft.content,
            reliability: draft.reliability,
            relevance: draft.relevance,
            collected_at: draft.collected_at.unwrap_or(now),
            verified: draft.verified,
            supersedes: draft.supersedes,
        };
        record.next_evidence_seq += 1;
        applied.evidence.push(evidence.id);
        record.evidence.push(evidence);
    }
    Ok(applied)
}

fn apply_findings(
    record: &mut InvestigationRecord,
    task_id: TaskID,
    capability: &Capability,
    target: Option<TargetID>,
    items: Vec<FindingDraft>,
) -> Result<Applied> {
    let mut confidences = Vec::with_capacity(items.len());
    for draft in &items {
        ensure_cited(record, &draft.cites)?;
        confidences.push(scoring::derived_confidence(&draft.cites, &record.evidence)?);
    }

    let now = Utc::now();
    let mut applied = Applied::default();
    for (draft, confidence) in items.into_iter().zip(confidences) {
        let finding = AnalysisResult {
            id: ResultID::new(),
            task: task_id,
            target,
            capability: capability.clone(),
            summary: draft.summary,
            cites: draft.cites,
            confidence,
            created_at: now,
        };
        applied.findings.push(finding.id);
        record.findings.push(finding);
    }
    Ok(applied)
}

fn apply_assessment(
    record: &mut InvestigationRecord,
    task_id: TaskID,
    capability: &Capability,
    draft: AssessmentDraft,
) -> Result<Applied> {
    ensure_cited(record, &draft.cites)?;
    if let Some(missing) = draft.findings.iter().find(|id| record.finding_by_id(id).is_none()) {
        return Err(InvestigationError::FatalWorker(format!(
            "assessment references unknown finding {missing}"
        )));
    }
    let confidence = scoring::derived_confidence(&draft.cites, &record.evidence)?;

    let assessment = ThreatAssessment {
        id: AssessmentID::new(),
        task: task_id,
        capability: capability.clone(),
        level: draft.level,
        summary: draft.summary,
        cites: draft.cites,
        findings: draft.findings,
        confidence,
        created_at: Utc::now(),
    };
    let mut applied = Applied::default();
    applied.assessments.push(assessment.id);
    record.assessments.push(assessment);
    Ok(applied)
}

fn ensure_cited(record: &InvestigationRecord, cites: &[EvidenceID]) -> Result<()> {
    let known: BTreeSet<EvidenceID> = record.evidence.iter().map(|e| e.id).collect();
    match cites.iter().find(|c| !known.contains(c)) {
        Some(missing) => Err(InvestigationError::FatalWorker(format!(
            "derived record cites unknown evidence {missing}"
        ))),
        None => Ok(()),
    }
}

#[derive(Debug, Default)]
struct Applied {
    evidence: Vec<EvidenceID>,
    findings: Vec<ResultID>,
    assessments: Vec<AssessmentID>,
    requirements: Vec<(TargetID, Capability)>,
}

impl Applied {
    fn refs(&self) -> Vec<ProductRef> {
        self.evidence
            .iter()
            .map(|id| ProductRef::Evidence(*id))
            .chain(self.findings.iter().map(|id| ProductRef::Finding(*id)))
            .chain(self.assessments.iter().map(|id| ProductRef::Assessment(*id)))
            .chain(
                self.requirements
                    .iter()
                    .map(|(_, cap)| ProductRef::Requirement(cap.clone())),
            )
            .collect()
    }
}
