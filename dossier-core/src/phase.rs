//! Phase entry planning and exit evaluation.
//!
//! The policy never mutates task state. The actor asks it what a phase
//! should run and whether the open phase is done, then acts on the answer.

use chrono::{DateTime, Utc};
use dossier_model::{Phase, Priority, TargetID, TargetStatus, TaskStatus};

use crate::config::PhaseConfig;
use crate::record::InvestigationRecord;
use crate::registry::{Capability, CapabilityRegistry};
use crate::worker::{EvidenceView, TaskPayload};

/// One task the actor should create on phase entry.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedTask {
    pub target: Option<TargetID>,
    pub capability: Capability,
    pub payload: TaskPayload,
    pub priority: Priority,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseVerdict {
    /// Work outstanding and the dwell limit has not passed.
    Pending,
    /// Every task settled and the exit predicate holds.
    Satisfied,
    /// Dwell limit passed with work outstanding.
    Expired,
    /// Every task settled but the exit predicate does not hold.
    Exhausted,
}

/// Aggregate numbers the exit predicate is computed from.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PhaseProgress {
    pub total: usize,
    pub settled: usize,
    pub completed: usize,
    pub products: usize,
}

impl PhaseProgress {
    /// 1.0 for a phase that produced no tasks.
    pub fn success_ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

#[derive(Clone, Debug)]
pub struct PhasePolicy {
    config: PhaseConfig,
}

impl PhasePolicy {
    pub fn new(config: PhaseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PhaseConfig {
        &self.config
    }

    /// Tasks to create when `phase` is entered, in dispatch order.
    pub fn plan_entry(&self, record: &InvestigationRecord, registry: &CapabilityRegistry, phase: Phase) -> Vec<PlannedTask> {
        let mut planned = match phase {
            Phase::Planning => plan_planning(record),
            Phase::Collection => plan_collection(record),
            Phase::Analysis => plan_analysis(record),
            Phase::Synthesis => plan_synthesis(record),
        };
        // keep capability groups in registration order for sequenced release
        let order = registry.capabilities();
        planned.sort_by_key(|p| order.iter().position(|c| c == &p.capability).unwrap_or(usize::MAX));
        planned
    }

    pub fn progress(&self, record: &InvestigationRecord) -> PhaseProgress {
        record
            .current_phase_tasks()
            .fold(PhaseProgress::default(), |mut acc, task| {
                acc.total += 1;
                if task.status.is_terminal() {
                    acc.settled += 1;
                }
                if task.status == TaskStatus::Completed {
                    acc.completed += 1;
                    acc.products += task.product_count();
                }
                acc
            })
    }

    pub fn evaluate(&self, record: &InvestigationRecord, now: DateTime<Utc>) -> PhaseVerdict {
        let exit = self.config.exit_for(record.phase);
        let progress = self.progress(record);

        if progress.total == 0 {
            return PhaseVerdict::Satisfied;
        }
        if progress.settled == progress.total {
            let ratio_met = progress.success_ratio() >= exit.min_success_ratio;
            let products_met = progress.products >= exit.min_evidence;
            return if ratio_met && products_met {
                PhaseVerdict::Satisfied
            } else {
                PhaseVerdict::Exhausted
            };
        }

        let dwell = (now - record.phase_entered_at).to_std().unwrap_or_default();
        if dwell >= exit.max_dwell() {
            PhaseVerdict::Expired
        } else {
            PhaseVerdict::Pending
        }
    }
}

/// Marks every target that still has collection work ACTIVE.
pub fn activate_targets(record: &mut InvestigationRecord) -> Vec<TargetID> {
    let mut activated = Vec::new();
    for target in record.targets.values_mut() {
        if matches!(target.status, TargetStatus::Pending | TargetStatus::Failed) {
            target.status = TargetStatus::Active;
            activated.push(target.id);
        }
    }
    activated
}

/// Splits planned tasks into consecutive capability groups.
pub fn capability_groups(planned: Vec<PlannedTask>) -> Vec<Vec<PlannedTask>> {
    let mut groups: Vec<Vec<PlannedTask>> = Vec::new();
    for task in planned {
        match groups.last_mut() {
            Some(group) if group[0].capability == task.capability => group.push(task),
            _ => groups.push(vec![task]),
        }
    }
    groups
}

fn objective(record: &InvestigationRecord) -> String {
    if record.objective.trim().is_empty() {
        record.title.clone()
    } else {
        record.objective.clone()
    }
}

fn plan_planning(record: &InvestigationRecord) -> Vec<PlannedTask> {
    let targets: Vec<_> = record.targets.values().map(|t| t.brief()).collect();
    record
        .plan
        .planning
        .iter()
        .map(|cap| PlannedTask {
            target: None,
            capability: cap.clone(),
            payload: TaskPayload::Plan {
                objective: objective(record),
                targets: targets.clone(),
            },
            priority: record.priority,
        })
        .collect()
}

fn plan_collection(record: &InvestigationRecord) -> Vec<PlannedTask> {
    record
        .targets
        .values()
        .filter(|t| t.status != TargetStatus::Completed)
        .flat_map(|target| {
            target
                .requirements
                .iter()
                .filter(|cap| !record.requirement_satisfied(target.id, cap))
                .map(|cap| PlannedTask {
                    target: Some(target.id),
                    capability: cap.clone(),
                    payload: TaskPayload::Collect {
                        target: target.brief(),
                    },
                    priority: target.priority,
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

fn plan_analysis(record: &InvestigationRecord) -> Vec<PlannedTask> {
    let heads = record.head_evidence();
    let mut planned = Vec::new();
    for cap in &record.plan.analysis {
        for target in record.targets.values() {
            let evidence: Vec<EvidenceView> = heads
                .iter()
                .filter(|e| e.target == target.id)
                .map(|e| e.view())
                .collect();
            if evidence.is_empty() {
                continue;
            }
            planned.push(PlannedTask {
                target: Some(target.id),
                capability: cap.clone(),
                payload: TaskPayload::Analyze {
                    target: target.brief(),
                    evidence,
                },
                priority: target.priority,
            });
        }
    }
    planned
}

fn plan_synthesis(record: &InvestigationRecord) -> Vec<PlannedTask> {
    let findings: Vec<_> = record.findings.iter().map(|f| f.view()).collect();
    record
        .plan
        .synthesis
        .iter()
        .map(|cap| PlannedTask {
            target: None,
            capability: cap.clone(),
            payload: TaskPayload::Synthesize {
                objective: objective(record),
                findings: findings.clone(),
            },
            priority: record.priority,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::record::fixtures;
    use crate::record::{AgentTask, Evidence, TransitionKind};
    use crate::registry::{CapabilityDescriptor, CapabilityKind};
    use crate::worker::{Outcome, WorkContext, Worker};
    use async_trait::async_trait;
    use dossier_model::{EvidenceID, TaskID};

    #[derive(Debug)]
    struct Idle;

    #[async_trait]
    impl Worker for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        async fn execute(&self, _: &Capability, _: &TaskPayload, _: &WorkContext) -> Outcome {
            Outcome::fatal("idle")
        }
    }

    fn registry() -> CapabilityRegistry {
        let w: Arc<dyn Worker> = Arc::new(Idle);
        CapabilityRegistry::builder()
            .register("collect-web", CapabilityDescriptor::new(CapabilityKind::Collection), w.clone())
            .register("collect-registry", CapabilityDescriptor::new(CapabilityKind::Collection), w.clone())
            .register("analyze-corroboration", CapabilityDescriptor::new(CapabilityKind::Analysis), w.clone())
            .register("synthesize-assessment", CapabilityDescriptor::new(CapabilityKind::Synthesis), w)
            .build()
            .unwrap()
    }

    fn evidence(record: &InvestigationRecord, label: &str, cap: &str, seq: u64) -> Evidence {
        let target = record.targets.values().find(|t| t.label == label).unwrap();
        Evidence {
            id: EvidenceID::new(),
            sequence: seq,
            investigation_id: record.id,
            target: target.id,
            task: TaskID::new(),
            capability: cap.into(),
            source_id: format!("src-{seq}"),
            source_type: "web".into(),
            content: String::new(),
            reliability: 80,
            relevance: 80,
            collected_at: Utc::now(),
            verified: false,
            supersedes: None,
        }
    }

    fn task(record: &InvestigationRecord, status: TaskStatus, products: usize) -> AgentTask {
        AgentTask {
            id: TaskID::new(),
            investigation_id: record.id,
            target: None,
            capability: "collect-web".into(),
            phase: record.phase,
            epoch: record.phase_epoch,
            priority: Priority::Medium,
            status,
            attempts: 1,
            payload: TaskPayload::Plan { objective: "x".into(), targets: vec![] },
            produced: (0..products)
                .map(|_| crate::record::ProductRef::Evidence(EvidenceID::new()))
                .collect(),
            error: None,
            annotations: vec![],
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    #[test]
    fn collection_plans_only_unsatisfied_requirements() {
        let mut record = fixtures::record();
        let ev = evidence(&record, "acme", "collect-registry", 1);
        record.evidence.push(ev);

        let planned = PhasePolicy::new(PhaseConfig::default()).plan_entry(&record, &registry(), Phase::Collection);
        let caps: Vec<&str> = planned.iter().map(|p| p.capability.as_str()).collect();
        // acme needs collect-web only, j.doe needs collect-web
        assert_eq!(caps, vec!["collect-web", "collect-web"]);
        let doe = planned.iter().find(|p| matches!(&p.payload, TaskPayload::Collect { target } if target.label == "j.doe")).unwrap();
        assert_eq!(doe.priority, Priority::Critical);
    }

    #[test]
    fn groups_follow_registry_order() {
        let record = fixtures::record();
        let planned = PhasePolicy::new(PhaseConfig::default()).plan_entry(&record, &registry(), Phase::Collection);
        let groups = capability_groups(planned);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].capability.as_str(), "collect-web");
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1][0].capability.as_str(), "collect-registry");
    }

    #[test]
    fn analysis_skips_targets_without_evidence() {
        let mut record = fixtures::record();
        let first = evidence(&record, "acme", "collect-web", 1);
        let mut fix = evidence(&record, "acme", "collect-web", 2);
        fix.supersedes = Some(first.id);
        record.evidence.push(first);
        record.evidence.push(fix.clone());

        let planned = PhasePolicy::new(PhaseConfig::default()).plan_entry(&record, &registry(), Phase::Analysis);
        assert_eq!(planned.len(), 1);
        let TaskPayload::Analyze { evidence, .. } = &planned[0].payload else {
            panic!("expected analysis payload");
        };
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].id, fix.id);
    }

    #[test]
    fn verdicts_follow_ratio_products_and_dwell() {
        let mut record = fixtures::record();
        record.enter_phase(Phase::Planning, TransitionKind::Opened).unwrap();
        record.enter_phase(Phase::Collection, TransitionKind::Satisfied).unwrap();
        let policy = PhasePolicy::new(PhaseConfig::default());
        let now = Utc::now();

        assert_eq!(policy.evaluate(&record, now), PhaseVerdict::Satisfied);

        let a = task(&record, TaskStatus::Completed, 2);
        let b = task(&record, TaskStatus::InProgress, 0);
        let b_id = b.id;
        record.tasks.insert(a.id, a);
        record.tasks.insert(b.id, b);
        assert_eq!(policy.evaluate(&record, now), PhaseVerdict::Pending);
        assert_eq!(
            policy.evaluate(&record, now + chrono::Duration::minutes(10)),
            PhaseVerdict::Expired
        );

        record.tasks.get_mut(&b_id).unwrap().status = TaskStatus::Failed;
        assert_eq!(policy.evaluate(&record, now), PhaseVerdict::Satisfied);

        let c = task(&record, TaskStatus::TimedOut, 0);
        record.tasks.insert(c.id, c);
        assert_eq!(policy.evaluate(&record, now), PhaseVerdict::Exhausted);
        assert_eq!(policy.progress(&record).products, 2);
    }

    #[test]
    fn tasks_of_earlier_epochs_do_not_count() {
        let mut record = fixtures::record();
        record.enter_phase(Phase::Planning, TransitionKind::Opened).unwrap();
        record.enter_phase(Phase::Collection, TransitionKind::Satisfied).unwrap();
        let stale = task(&record, TaskStatus::Failed, 0);
        record.tasks.insert(stale.id, stale);
        record.enter_phase(Phase::Planning, TransitionKind::Reopened).unwrap();
        record.enter_phase(Phase::Collection, TransitionKind::Satisfied).unwrap();

        let policy = PhasePolicy::new(PhaseConfig::default());
        assert_eq!(policy.progress(&record).total, 0);
    }

    #[test]
    fn failed_targets_reactivate() {
        let mut record = fixtures::record();
        for t in record.targets.values_mut() {
            t.status = TargetStatus::Failed;
        }
        let first = record.targets.keys().next().copied().unwrap();
        record.targets.get_mut(&first).unwrap().status = TargetStatus::Completed;
        assert_eq!(activate_targets(&mut record).len(), 1);
    }
}
