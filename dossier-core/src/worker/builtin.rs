//! Workers that ship with the orchestrator.
//!
//! [`FixtureWorker`] replays canned collection results keyed by target
//! label. The analyzer and synthesizer only read what the pipeline hands
//! them, so they work with any collection source.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use dossier_model::ThreatLevel;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    AssessmentDraft, EvidenceDraft, FindingDraft, Outcome, RequirementSuggestion,
    TaskPayload, WorkContext, WorkProduct, Worker,
};
use crate::registry::Capability;

/// Canned answer for one (capability, target label) pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FixtureResponse {
    Evidence {
        items: Vec<EvidenceDraft>,
    },
    Fail {
        message: String,
    },
    /// Retryable failure for the first `fail_first` attempts.
    Flaky {
        fail_first: u32,
        items: Vec<EvidenceDraft>,
    },
    /// Planning only: extra collection requirements for the target.
    Suggest {
        capabilities: Vec<Capability>,
    },
}

#[derive(Clone, Debug)]
pub struct FixtureWorker {
    name: String,
    latency: Duration,
    fixtures: HashMap<(Capability, String), FixtureResponse>,
}

impl FixtureWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency: Duration::ZERO,
            fixtures: HashMap::new(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_fixture(
        mut self,
        capability: impl Into<Capability>,
        label: impl Into<String>,
        response: FixtureResponse,
    ) -> Self {
        self.insert(capability, label, response);
        self
    }

    pub fn insert(
        &mut self,
        capability: impl Into<Capability>,
        label: impl Into<String>,
        response: FixtureResponse,
    ) {
        self.fixtures
            .insert((capability.into(), label.into()), response);
    }

    fn lookup(&self, capability: &Capability, label: &str) -> Option<&FixtureResponse> {
        self.fixtures.get(&(capability.clone(), label.to_string()))
    }

    fn plan(&self, capability: &Capability, payload: &TaskPayload) -> Outcome {
        let TaskPayload::Plan { targets, .. } = payload else {
            return Outcome::fatal("planning fixture received a non-plan payload");
        };
        let suggestions = targets
            .iter()
            .filter_map(|t| match self.lookup(capability, &t.label) {
                Some(FixtureResponse::Suggest { capabilities }) => Some(
                    capabilities
                        .iter()
                        .map(|cap| RequirementSuggestion {
                            target: t.id,
                            capability: cap.clone(),
                        })
                        .collect::<Vec<_>>(),
                ),
                _ => None,
            })
            .flatten()
            .collect();
        Outcome::Success(WorkProduct::Plan { suggestions })
    }

    fn collect(&self, capability: &Capability, label: &str, attempt: u32) -> Outcome {
        match self.lookup(capability, label) {
            Some(FixtureResponse::Evidence { items }) => {
                Outcome::Success(WorkProduct::Evidence { items: items.clone() })
            }
            Some(FixtureResponse::Fail { message }) => Outcome::fatal(message.clone()),
            Some(FixtureResponse::Flaky { fail_first, items }) => {
                if attempt <= *fail_first {
                    Outcome::retryable(format!("{label} unavailable on attempt {attempt}"))
                } else {
                    Outcome::Success(WorkProduct::Evidence { items: items.clone() })
                }
            }
            Some(FixtureResponse::Suggest { .. }) => {
                Outcome::fatal(format!("fixture for {capability}/{label} is a planning fixture"))
            }
            None => Outcome::fatal(format!("no fixture for {capability}/{label}")),
        }
    }
}

#[async_trait]
impl Worker for FixtureWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, capability: &Capability, payload: &TaskPayload, ctx: &WorkContext) -> Outcome {
        if !self.latency.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.latency) => {}
                _ = ctx.cancel.cancelled() => {
                    return Outcome::retryable("cancelled while collecting");
                }
            }
        }

        match payload {
            TaskPayload::Plan { .. } => self.plan(capability, payload),
            TaskPayload::Collect { target } => {
                debug!(worker = %self.name, capability = %capability, target = %target.label, attempt = ctx.attempt, "fixture lookup");
                self.collect(capability, &target.label, ctx.attempt)
            }
            other => Outcome::fatal(format!(
                "fixture worker cannot handle {} payloads",
                other.kind()
            )),
        }
    }
}

/// Emits one finding per target citing the evidence it was handed.
#[derive(Clone, Debug)]
pub struct CorroborationAnalyzer {
    name: String,
    min_reliability: u8,
}

impl CorroborationAnalyzer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_reliability: 0,
        }
    }

    /// Evidence below this reliability is left out of citations unless
    /// nothing clears it.
    pub fn with_min_reliability(mut self, min_reliability: u8) -> Self {
        self.min_reliability = min_reliability.min(100);
        self
    }
}

#[async_trait]
impl Worker for CorroborationAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _capability: &Capability, payload: &TaskPayload, _ctx: &WorkContext) -> Outcome {
        let TaskPayload::Analyze { target, evidence } = payload else {
            return Outcome::fatal("analyzer received a non-analysis payload");
        };
        if evidence.is_empty() {
            return Outcome::fatal(format!("no evidence to analyze for {}", target.label));
        }

        let strong: Vec<_> = evidence
            .iter()
            .filter(|e| e.reliability >= self.min_reliability)
            .collect();
        let cited = if strong.is_empty() {
            evidence.iter().collect()
        } else {
            strong
        };

        let source_types: BTreeSet<&str> = cited.iter().map(|e| e.source_type.as_str()).collect();
        let verified = cited.iter().filter(|e| e.verified).count();
        let summary = format!(
            "{}: {} source(s) across {} source type(s), {} verified",
            target.label,
            cited.len(),
            source_types.len(),
            verified
        );

        Outcome::Success(WorkProduct::Findings {
            items: vec![FindingDraft {
                summary,
                cites: cited.iter().map(|e| e.id).collect(),
            }],
        })
    }
}

/// Folds all findings into a single assessment.
#[derive(Clone, Debug)]
pub struct AssessmentSynthesizer {
    name: String,
}

impl AssessmentSynthesizer {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Worker for AssessmentSynthesizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _capability: &Capability, payload: &TaskPayload, _ctx: &WorkContext) -> Outcome {
        let TaskPayload::Synthesize { objective, findings } = payload else {
            return Outcome::fatal("synthesizer received a non-synthesis payload");
        };
        if findings.is_empty() {
            return Outcome::fatal("no findings to synthesize");
        }

        let mut seen = BTreeSet::new();
        let cites = findings
            .iter()
            .flat_map(|f| f.cites.iter().copied())
            .filter(|id| seen.insert(*id))
            .collect();
        let signal = findings.iter().map(|f| f.confidence).sum::<f64>() / findings.len() as f64;
        let level = ThreatLevel::from_signal(signal);

        Outcome::Success(WorkProduct::Assessment {
            draft: AssessmentDraft {
                level,
                summary: format!("{objective}: {level} across {} finding(s)", findings.len()),
                cites,
                findings: findings.iter().map(|f| f.id).collect(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{EvidenceView, FindingView, TargetBrief};
    use dossier_model::{EvidenceID, InvestigationID, ResultID, TargetID, TargetKind, TaskID};
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx(attempt: u32) -> WorkContext {
        WorkContext {
            investigation_id: InvestigationID(Uuid::from_u128(1)),
            task_id: TaskID(Uuid::from_u128(2)),
            attempt,
            deadline: Instant::now() + Duration::from_secs(5),
            cancel: CancellationToken::new(),
        }
    }

    fn brief(label: &str) -> TargetBrief {
        TargetBrief {
            id: TargetID(Uuid::from_u128(10)),
            label: label.into(),
            kind: TargetKind::Organization,
        }
    }

    fn draft(source: &str) -> EvidenceDraft {
        EvidenceDraft {
            source_id: source.into(),
            source_type: "registry".into(),
            content: "filing".into(),
            reliability: 80,
            relevance: 80,
            collected_at: None,
            verified: true,
            supersedes: None,
        }
    }

    fn view(n: u128, reliability: u8, source_type: &str) -> EvidenceView {
        EvidenceView {
            id: EvidenceID(Uuid::from_u128(n)),
            source_id: format!("s{n}"),
            source_type: source_type.into(),
            content: String::new(),
            reliability,
            relevance: 50,
            verified: n % 2 == 0,
        }
    }

    #[tokio::test]
    async fn fixture_replays_and_flakes() {
        let worker = FixtureWorker::new("fixtures")
            .with_fixture("collect-registry", "acme", FixtureResponse::Evidence { items: vec![draft("ch")] })
            .with_fixture(
                "collect-web",
                "acme",
                FixtureResponse::Flaky { fail_first: 1, items: vec![draft("web")] },
            );
        let payload = TaskPayload::Collect { target: brief("acme") };

        let out = worker.execute(&"collect-registry".into(), &payload, &ctx(1)).await;
        assert!(out.is_success());

        let first = worker.execute(&"collect-web".into(), &payload, &ctx(1)).await;
        assert!(matches!(first, Outcome::Retryable(_)));
        let second = worker.execute(&"collect-web".into(), &payload, &ctx(2)).await;
        assert!(second.is_success());
    }

    #[tokio::test]
    async fn missing_fixture_is_fatal_not_fabricated() {
        let worker = FixtureWorker::new("fixtures");
        let out = worker
            .execute(&"collect-web".into(), &TaskPayload::Collect { target: brief("ghost") }, &ctx(1))
            .await;
        let Outcome::Fatal(err) = out else {
            panic!("expected fatal");
        };
        assert!(err.message.contains("ghost"));
    }

    #[tokio::test]
    async fn planning_fixture_suggests_requirements() {
        let worker = FixtureWorker::new("fixtures").with_fixture(
            "plan-scope",
            "acme",
            FixtureResponse::Suggest { capabilities: vec!["collect-social".into()] },
        );
        let payload = TaskPayload::Plan {
            objective: "scope".into(),
            targets: vec![brief("acme"), brief("other")],
        };
        let Outcome::Success(WorkProduct::Plan { suggestions }) =
            worker.execute(&"plan-scope".into(), &payload, &ctx(1)).await
        else {
            panic!("expected plan");
        };
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].capability, Capability::from("collect-social"));
    }

    #[tokio::test]
    async fn analyzer_prefers_reliable_sources() {
        let analyzer = CorroborationAnalyzer::new("corroboration").with_min_reliability(60);
        let payload = TaskPayload::Analyze {
            target: brief("acme"),
            evidence: vec![view(1, 90, "registry"), view(2, 30, "web"), view(4, 70, "web")],
        };
        let Outcome::Success(WorkProduct::Findings { items }) =
            analyzer.execute(&"analyze".into(), &payload, &ctx(1)).await
        else {
            panic!("expected findings");
        };
        assert_eq!(items[0].cites, vec![EvidenceID(Uuid::from_u128(1)), EvidenceID(Uuid::from_u128(4))]);
        assert!(items[0].summary.contains("2 source type(s)"));
    }

    #[tokio::test]
    async fn synthesizer_unions_citations() {
        let shared = EvidenceID(Uuid::from_u128(1));
        let findings = vec![
            FindingView {
                id: ResultID(Uuid::from_u128(5)),
                target: None,
                summary: "a".into(),
                cites: vec![shared, EvidenceID(Uuid::from_u128(2))],
                confidence: 0.9,
            },
            FindingView {
                id: ResultID(Uuid::from_u128(6)),
                target: None,
                summary: "b".into(),
                cites: vec![shared],
                confidence: 0.7,
            },
        ];
        let payload = TaskPayload::Synthesize { objective: "ownership".into(), findings };
        let Outcome::Success(WorkProduct::Assessment { draft }) =
            AssessmentSynthesizer::new("synth").execute(&"synthesize".into(), &payload, &ctx(1)).await
        else {
            panic!("expected assessment");
        };
        assert_eq!(draft.cites.len(), 2);
        assert_eq!(draft.findings.len(), 2);
        assert_eq!(draft.level, ThreatLevel::from_signal(0.8));
    }
}
